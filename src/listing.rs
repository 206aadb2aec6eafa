//! `ls -la` output parsing
//!
//! The listing format is platform- and locale-dependent, so parsing is
//! best-effort: a line that does not look like a long-format row still
//! produces an entry of kind [`EntryKind::Unknown`] instead of failing the
//! whole directory.

use serde::{Deserialize, Serialize};

/// Minimum number of whitespace-separated columns in a long-format row
const MIN_FIELDS: usize = 8;

/// Kind of a remote filesystem item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

impl EntryKind {
    fn from_permissions(permissions: &str) -> Self {
        match permissions.chars().next() {
            Some('d') => EntryKind::Directory,
            Some('l') => EntryKind::Symlink,
            _ => EntryKind::File,
        }
    }
}

/// One parsed listing row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    /// Raw date text as printed by the remote `ls`; not calendar-parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
}

impl FileEntry {
    fn unparsed(line: &str) -> Self {
        Self {
            name: line.trim().to_string(),
            kind: EntryKind::Unknown,
            size: None,
            permissions: None,
            modified: None,
        }
    }
}

/// Parse `ls -la` output lines into entries, preserving input order.
pub fn parse<S: AsRef<str>>(lines: &[S]) -> Vec<FileEntry> {
    lines
        .iter()
        .map(AsRef::as_ref)
        .filter(|line| !matches!(line.split_whitespace().next(), None | Some("total")))
        .filter_map(parse_line)
        .filter(|entry| entry.name != "." && entry.name != "..")
        .collect()
}

fn parse_line(line: &str) -> Option<FileEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < MIN_FIELDS {
        return Some(FileEntry::unparsed(line));
    }

    // Filenames may contain spaces and ls does not escape them.
    let name = fields[MIN_FIELDS..].join(" ");
    if name.is_empty() {
        // No name column; keep the row visible rather than guess.
        return Some(FileEntry::unparsed(line));
    }

    let permissions = fields[0];
    Some(FileEntry {
        name,
        kind: EntryKind::from_permissions(permissions),
        size: fields[4].parse::<u64>().ok(),
        permissions: Some(permissions.to_string()),
        modified: Some(fields[5..MIN_FIELDS].join(" ")),
    })
}

/// Build the listing command for `path`, or for the login directory when absent.
pub fn listing_command(path: Option<&str>) -> String {
    match path.filter(|p| !p.is_empty()) {
        Some(path) => format!("ls -la -- {}", shell_quote(path)),
        None => "ls -la".to_string(),
    }
}

/// Quote a string for a POSIX shell using single quotes.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[&str] = &[
        "total 48",
        "drwxr-xr-x  5 alice staff   160 Mar  3 09:14 .",
        "drwxr-xr-x 12 root  root   4096 Feb 28 17:02 ..",
        "-rw-r--r--  1 alice staff  4096 Jan  1 12:00 notes.txt",
        "drwx------  2 alice staff    64 Mar  3 09:10 .ssh",
        "lrwxrwxrwx  1 alice staff    11 Dec 24  2023 current -> releases/42",
        "-rw-r--r--  1 alice staff   220 Oct  9 08:00 my summer photos.tar",
    ];

    #[test]
    fn test_example_row() {
        let entries = parse(&["-rw-r--r-- 1 user group 4096 Jan 1 12:00 notes.txt"]);
        assert_eq!(
            entries,
            vec![FileEntry {
                name: "notes.txt".to_string(),
                kind: EntryKind::File,
                size: Some(4096),
                permissions: Some("-rw-r--r--".to_string()),
                modified: Some("Jan 1 12:00".to_string()),
            }]
        );
    }

    #[test]
    fn test_total_line_dropped() {
        assert!(parse(&["total 48"]).is_empty());
    }

    #[test]
    fn test_dot_entries_dropped() {
        let entries = parse(SAMPLE);
        assert!(entries.iter().all(|e| e.name != "." && e.name != ".."));
        assert_eq!(entries.len(), 4);
    }

    #[test]
    fn test_kinds_follow_permission_char() {
        let entries = parse(SAMPLE);
        let kinds: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("notes.txt", EntryKind::File),
                (".ssh", EntryKind::Directory),
                ("current -> releases/42", EntryKind::Symlink),
                ("my summer photos.tar", EntryKind::File),
            ]
        );
    }

    #[test]
    fn test_symlink_target_is_not_decoded() {
        // Known limitation: the arrow and target stay in the name.
        let entries = parse(&["lrwxrwxrwx 1 a b 11 Dec 24 2023 current -> releases/42"]);
        assert_eq!(entries[0].name, "current -> releases/42");
        assert_eq!(entries[0].kind, EntryKind::Symlink);
    }

    #[test]
    fn test_spaces_in_name_collapse_to_single() {
        let entries = parse(&["-rw-r--r-- 1 a b 1 Jan 1 12:00 two   spaces"]);
        assert_eq!(entries[0].name, "two spaces");
    }

    #[test]
    fn test_short_line_is_unknown() {
        let entries = parse(&["ls: cannot open directory"]);
        assert_eq!(entries[0].kind, EntryKind::Unknown);
        assert_eq!(entries[0].name, "ls: cannot open directory");
        assert!(entries[0].size.is_none());
        assert!(entries[0].permissions.is_none());
        assert!(entries[0].modified.is_none());
    }

    #[test]
    fn test_bad_size_is_absent() {
        let entries = parse(&["crw-rw-rw- 1 root tty 5, 0 Jan 1 12:00 tty"]);
        // "5," is not a size; the extra column also shifts into the date/name.
        assert_eq!(entries[0].size, None);
        assert_eq!(entries[0].kind, EntryKind::File);
    }

    #[test]
    fn test_eight_fields_without_name_is_unknown() {
        let entries = parse(&["-rw-r--r-- 1 a b 1 Jan 1 12:00  "]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Unknown);
        assert_eq!(entries[0].name, "-rw-r--r-- 1 a b 1 Jan 1 12:00");
        assert_eq!(entries[0].size, None);
    }

    #[test]
    fn test_total_and_garbage_never_fail() {
        let garbled = String::from_utf8_lossy(&[0xff, 0xfe, b' ', b'x', 0x80]).into_owned();
        let input = vec![
            String::new(),
            "   ".to_string(),
            garbled,
            "\t".to_string(),
            "d".to_string(),
        ];
        let entries = parse(&input);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.kind == EntryKind::Unknown && !e.name.is_empty()));
    }

    #[test]
    fn test_reparse_is_stable() {
        assert_eq!(parse(SAMPLE), parse(SAMPLE));
    }

    #[test]
    fn test_order_preserved() {
        let entries = parse(&[
            "-rw-r--r-- 1 a b 1 Jan 1 12:00 zeta",
            "-rw-r--r-- 1 a b 1 Jan 1 12:00 alpha",
        ]);
        assert_eq!(entries[0].name, "zeta");
        assert_eq!(entries[1].name, "alpha");
    }

    #[test]
    fn test_listing_command() {
        assert_eq!(listing_command(None), "ls -la");
        assert_eq!(listing_command(Some("")), "ls -la");
        assert_eq!(listing_command(Some("/var/log")), "ls -la -- '/var/log'");
        assert_eq!(listing_command(Some("it's")), r"ls -la -- 'it'\''s'");
    }
}
