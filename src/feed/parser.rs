use feed_rs::model::{Entry, Link};
use feed_rs::parser;
use std::collections::HashSet;

use crate::storage::{ParsedEnclosure, ParsedEntry, ParsedFeed};

/// Decode an RSS, Atom or JSON Feed document.
///
/// Only whole-document failures are errors. Entries that turn out to be
/// unusable are passed through and reported later by the merge.
///
/// feed-rs would otherwise invent ids for entries without one, using a
/// random UUID when there is no link. Missing ids are left empty here so
/// the merge derives a stable identifier from the entry's own fields.
pub fn parse_document(bytes: &[u8]) -> Result<ParsedFeed, parser::ParseFeedError> {
    let feed = parser::Builder::new()
        .id_generator(|_, _, _| String::new())
        .build()
        .parse(bytes)?;

    let image_url = feed
        .logo
        .as_ref()
        .or(feed.icon.as_ref())
        .map(|image| image.uri.clone())
        .filter(|uri| !uri.trim().is_empty());

    Ok(ParsedFeed {
        title: feed.title.map(|t| t.content),
        summary: feed.description.map(|d| d.content),
        image_url,
        entries: feed.entries.into_iter().map(convert_entry).collect(),
    })
}

fn convert_entry(entry: Entry) -> ParsedEntry {
    let identifier = if entry.id.trim().is_empty() {
        None
    } else {
        Some(entry.id.clone())
    };

    let link = entry
        .links
        .iter()
        .find(|l| !is_enclosure_link(l))
        .map(|l| l.href.clone());
    let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());
    let summary = entry.summary.map(|s| s.content);
    let content = entry.content.and_then(|c| c.body);
    let author = entry
        .authors
        .first()
        .map(|p| p.name.trim().to_string())
        .filter(|name| !name.is_empty());

    // Atom carries enclosures as links, RSS <enclosure> and Media RSS as media objects
    let mut seen = HashSet::new();
    let mut enclosures = Vec::new();
    let link_enclosures = entry
        .links
        .iter()
        .filter(|l| is_enclosure_link(l))
        .map(|l| ParsedEnclosure {
            url: l.href.clone(),
            kind: l.media_type.clone(),
        });
    let media_enclosures = entry.media.iter().flat_map(|media| {
        media.content.iter().filter_map(|c| {
            c.url.as_ref().map(|url| ParsedEnclosure {
                url: url.to_string(),
                kind: c.content_type.as_ref().map(|m| m.to_string()),
            })
        })
    });
    for enclosure in link_enclosures.chain(media_enclosures) {
        if !enclosure.url.trim().is_empty() && seen.insert(enclosure.url.clone()) {
            enclosures.push(enclosure);
        }
    }

    ParsedEntry {
        identifier,
        title: entry.title.map(|t| t.content).unwrap_or_default(),
        link,
        summary,
        author,
        published,
        content,
        enclosures,
    }
}

fn is_enclosure_link(link: &Link) -> bool {
    link.rel.as_deref() == Some("enclosure")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::merge::{entry_identifier, plan_merge, DecodeWarning};
    use pretty_assertions::assert_eq;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Example Podcast</title>
    <description>Weekly episodes</description>
    <item>
        <guid>ep-1</guid>
        <title>Episode 1</title>
        <link>https://example.com/ep1</link>
        <description>First episode</description>
        <pubDate>Tue, 14 Nov 2023 22:13:20 GMT</pubDate>
        <enclosure url="https://cdn.example.com/ep1.mp3" type="audio/mpeg" length="1234"/>
    </item>
    <item>
        <guid>ep-2</guid>
        <title>Episode 2</title>
    </item>
</channel></rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
    <title>Atom Blog</title>
    <id>urn:uuid:feed</id>
    <updated>2023-11-14T22:13:20Z</updated>
    <entry>
        <id>urn:uuid:entry-1</id>
        <title>Post</title>
        <link rel="alternate" href="https://example.com/post"/>
        <link rel="enclosure" type="image/png" href="https://example.com/pic.png"/>
        <author><name>Ada</name></author>
        <updated>2023-11-14T22:13:20Z</updated>
        <content type="html">&lt;p&gt;Body&lt;/p&gt;</content>
    </entry>
</feed>"#;

    #[test]
    fn test_parse_rss_with_enclosure() {
        let feed = parse_document(RSS.as_bytes()).unwrap();
        assert_eq!(feed.title.as_deref(), Some("Example Podcast"));
        assert_eq!(feed.summary.as_deref(), Some("Weekly episodes"));
        assert_eq!(feed.entries.len(), 2);

        let first = &feed.entries[0];
        assert_eq!(first.identifier.as_deref(), Some("ep-1"));
        assert_eq!(first.title, "Episode 1");
        assert_eq!(first.link.as_deref(), Some("https://example.com/ep1"));
        assert_eq!(first.published, Some(1_700_000_000));
        assert_eq!(first.enclosures.len(), 1);
        assert_eq!(first.enclosures[0].url, "https://cdn.example.com/ep1.mp3");
        assert_eq!(first.enclosures[0].kind.as_deref(), Some("audio/mpeg"));

        assert!(feed.entries[1].enclosures.is_empty());
    }

    #[test]
    fn test_parse_atom_links_and_content() {
        let feed = parse_document(ATOM.as_bytes()).unwrap();
        let entry = &feed.entries[0];
        assert_eq!(entry.identifier.as_deref(), Some("urn:uuid:entry-1"));
        assert_eq!(entry.link.as_deref(), Some("https://example.com/post"));
        assert_eq!(entry.author.as_deref(), Some("Ada"));
        assert_eq!(entry.published, Some(1_700_000_000));
        assert_eq!(entry.content.as_deref(), Some("<p>Body</p>"));
        assert_eq!(
            entry.enclosures,
            vec![ParsedEnclosure {
                url: "https://example.com/pic.png".into(),
                kind: Some("image/png".into()),
            }]
        );
    }

    const GUIDLESS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>No Ids</title>
    <item><title>Only a title</title><description>body</description></item>
    <item><title>Linked</title><link>https://example.com/linked</link></item>
</channel></rss>"#;

    #[test]
    fn test_missing_guid_yields_stable_identifier() {
        let first = parse_document(GUIDLESS.as_bytes()).unwrap();
        let second = parse_document(GUIDLESS.as_bytes()).unwrap();

        assert_eq!(first.entries[0].identifier, None);
        assert_eq!(first.entries[1].identifier, None);

        let ids = |feed: &ParsedFeed| -> Vec<Option<String>> {
            feed.entries.iter().map(entry_identifier).collect()
        };
        let first_ids = ids(&first);
        assert!(first_ids.iter().all(Option::is_some));
        assert_eq!(first_ids, ids(&second));
        assert_ne!(first_ids[0], first_ids[1]);
    }

    #[test]
    fn test_empty_item_is_unidentifiable_after_merge_planning() {
        let doc = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Sparse</title>
    <item><title>Kept</title></item>
    <item><description>just a description</description></item>
</channel></rss>"#;
        let feed = parse_document(doc.as_bytes()).unwrap();
        assert_eq!(feed.entries.len(), 2);
        assert_eq!(entry_identifier(&feed.entries[1]), None);

        let plan = plan_merge(&[], &feed.entries, 1_700_000_000);
        assert_eq!(plan.creates.len(), 1);
        assert_eq!(plan.warnings, vec![DecodeWarning::Unidentifiable { index: 1 }]);
    }

    #[test]
    fn test_empty_channel() {
        let feed =
            parse_document(br#"<?xml version="1.0"?><rss version="2.0"><channel></channel></rss>"#)
                .unwrap();
        assert!(feed.entries.is_empty());
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(parse_document(b"<not valid xml").is_err());
        assert!(parse_document(b"").is_err());
    }
}
