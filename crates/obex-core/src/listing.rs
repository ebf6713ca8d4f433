//! Listing serialization.
//!
//! A renderer turns one directory or message entry into bytes. The transfer
//! pipeline never re-serializes an entry: whatever does not fit the current
//! packet is carried over verbatim into the next one.

use crate::callout::{DirEntry, MessageEntry};
use std::fmt;

/// Serializes listing objects
pub trait ListingRenderer: Send + Sync + fmt::Debug {
    /// Folder listing preamble; `at_root` suppresses the parent-folder entry
    fn folder_header(&self, at_root: bool) -> Vec<u8>;
    /// One folder listing element
    fn folder_entry(&self, entry: &DirEntry) -> Vec<u8>;
    /// Folder listing epilogue
    fn folder_footer(&self) -> Vec<u8>;
    /// Message listing preamble
    fn message_header(&self) -> Vec<u8>;
    /// One message listing element
    fn message_entry(&self, entry: &MessageEntry) -> Vec<u8>;
    /// Message listing epilogue
    fn message_footer(&self) -> Vec<u8>;
}

/// XML renderer for `x-obex/folder-listing` and `x-bt/MAP-msg-listing`
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlListing;

const FOLDER_PROLOGUE: &str = "<?xml version=\"1.0\"?>\n\
<!DOCTYPE folder-listing SYSTEM \"obex-folder-listing.dtd\">\n\
<folder-listing version=\"1.0\">\n";

const MESSAGE_PROLOGUE: &str = "<MAP-msg-listing version=\"1.0\">\n";

impl ListingRenderer for XmlListing {
    fn folder_header(&self, at_root: bool) -> Vec<u8> {
        let mut out = String::from(FOLDER_PROLOGUE);
        if !at_root {
            out.push_str("<parent-folder/>\n");
        }
        out.into_bytes()
    }

    fn folder_entry(&self, entry: &DirEntry) -> Vec<u8> {
        let mut out = String::with_capacity(64 + entry.name.len());
        if entry.is_dir {
            out.push_str("<folder name=\"");
            out.push_str(&escape(&entry.name));
            out.push('"');
        } else {
            out.push_str("<file name=\"");
            out.push_str(&escape(&entry.name));
            out.push_str(&format!("\" size=\"{}\"", entry.size));
        }
        if let Some(perm) = &entry.user_perm {
            out.push_str(&format!(" user-perm=\"{}\"", escape(perm)));
        }
        if let Some(modified) = &entry.modified {
            out.push_str(&format!(" modified=\"{}\"", escape(modified)));
        }
        out.push_str("/>\n");
        out.into_bytes()
    }

    fn folder_footer(&self) -> Vec<u8> {
        b"</folder-listing>\n".to_vec()
    }

    fn message_header(&self) -> Vec<u8> {
        MESSAGE_PROLOGUE.as_bytes().to_vec()
    }

    fn message_entry(&self, entry: &MessageEntry) -> Vec<u8> {
        format!(
            "<msg handle=\"{}\" subject=\"{}\" datetime=\"{}\" sender_addressing=\"{}\" \
             recipient_addressing=\"{}\" type=\"{}\" size=\"{}\" read=\"{}\"/>\n",
            escape(&entry.handle.0),
            escape(&entry.subject),
            escape(&entry.datetime),
            escape(&entry.sender),
            escape(&entry.recipient),
            escape(&entry.kind),
            entry.size,
            if entry.read { "yes" } else { "no" },
        )
        .into_bytes()
    }

    fn message_footer(&self) -> Vec<u8> {
        b"</MAP-msg-listing>\n".to_vec()
    }
}

/// Escape XML attribute text
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callout::MessageHandle;

    fn file(name: &str, size: u64) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            is_dir: false,
            size,
            modified: None,
            user_perm: None,
        }
    }

    #[test]
    fn test_parent_folder_only_below_root() {
        let root = String::from_utf8(XmlListing.folder_header(true)).unwrap();
        let child = String::from_utf8(XmlListing.folder_header(false)).unwrap();
        assert!(!root.contains("parent-folder"));
        assert!(child.contains("<parent-folder/>"));
    }

    #[test]
    fn test_file_entry() {
        let xml = String::from_utf8(XmlListing.folder_entry(&file("a.txt", 12))).unwrap();
        assert_eq!(xml, "<file name=\"a.txt\" size=\"12\"/>\n");
    }

    #[test]
    fn test_folder_entry_with_attributes() {
        let entry = DirEntry {
            name: "photos".into(),
            is_dir: true,
            size: 0,
            modified: Some("20240102T030405Z".into()),
            user_perm: Some("RW".into()),
        };
        let xml = String::from_utf8(XmlListing.folder_entry(&entry)).unwrap();
        assert_eq!(
            xml,
            "<folder name=\"photos\" user-perm=\"RW\" modified=\"20240102T030405Z\"/>\n"
        );
    }

    #[test]
    fn test_names_are_escaped() {
        let xml = String::from_utf8(XmlListing.folder_entry(&file("a&<b>\".txt", 1))).unwrap();
        assert!(xml.contains("a&amp;&lt;b&gt;&quot;.txt"));
    }

    #[test]
    fn test_message_entry() {
        let entry = MessageEntry {
            handle: MessageHandle("20000100001".into()),
            subject: "Hi".into(),
            datetime: "20240101T120000".into(),
            sender: "+1555".into(),
            recipient: "+1666".into(),
            kind: "SMS_GSM".into(),
            size: 2,
            read: false,
        };
        let xml = String::from_utf8(XmlListing.message_entry(&entry)).unwrap();
        assert!(xml.starts_with("<msg handle=\"20000100001\""));
        assert!(xml.contains("read=\"no\""));
    }
}
