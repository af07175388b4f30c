use serde::{Deserialize, Serialize};

/// Per-file action recorded by the depot for one changelist.
///
/// Decoded once at the extractor boundary; downstream code never parses
/// action strings again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Add,
    Edit,
    Delete,
    Branch,
    Integrate,
    MoveAdd,
    MoveDelete,
    Purge,
    Import,
    Archive,
}

impl FileAction {
    pub fn parse(action: &str) -> Option<Self> {
        Some(match action {
            "add" => FileAction::Add,
            "edit" => FileAction::Edit,
            "delete" => FileAction::Delete,
            "branch" => FileAction::Branch,
            "integrate" => FileAction::Integrate,
            "move/add" => FileAction::MoveAdd,
            "move/delete" => FileAction::MoveDelete,
            "purge" => FileAction::Purge,
            "import" => FileAction::Import,
            "archive" => FileAction::Archive,
            _ => return None,
        })
    }

    /// Actions that remove the file; everything else needs content
    /// fetched from the depot.
    pub fn is_delete(self) -> bool {
        matches!(
            self,
            FileAction::Delete | FileAction::MoveDelete | FileAction::Purge
        )
    }

    pub fn is_add(self) -> bool {
        matches!(self, FileAction::Add | FileAction::Branch | FileAction::MoveAdd)
    }

    /// Actions whose filelog entry can carry "branched/copied from"
    /// provenance, the signal used for branch-parent discovery.
    pub fn is_integration(self) -> bool {
        matches!(self, FileAction::Branch | FileAction::Integrate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileAction::Add => "add",
            FileAction::Edit => "edit",
            FileAction::Delete => "delete",
            FileAction::Branch => "branch",
            FileAction::Integrate => "integrate",
            FileAction::MoveAdd => "move/add",
            FileAction::MoveDelete => "move/delete",
            FileAction::Purge => "purge",
            FileAction::Import => "import",
            FileAction::Archive => "archive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileTypeBase {
    Text,
    Binary,
    Symlink,
    Unicode,
    Utf8,
    Utf16,
    Apple,
    Resource,
}

/// Keyword-expansion mode from the `k`/`ko` type modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordMode {
    #[default]
    None,
    /// `+k`: the full keyword set is expanded.
    Full,
    /// `+ko`: only Id and Header are expanded.
    IdOnly,
}

/// Canonicalized depot file type: base plus the modifier flags this tool
/// cares about. Unrecognized modifiers are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileType {
    pub base: FileTypeBase,
    pub executable: bool,
    pub keywords: KeywordMode,
}

impl FileType {
    /// Parse a depot type string ("text", "binary+x", "ktext", ...),
    /// canonicalizing the historical single-word aliases first.
    pub fn parse(raw: &str) -> Option<Self> {
        let canonical = match raw {
            "ctempobj" => "binary+Sw",
            "ctext" => "text+C",
            "cxtext" => "text+Cx",
            "ktext" => "text+k",
            "kxtext" => "text+kx",
            "ltext" => "text+F",
            "tempobj" => "binary+FSw",
            "ubinary" => "binary+F",
            "uresource" => "resource+F",
            "uxbinary" => "binary+Fx",
            "xbinary" => "binary+x",
            "xltext" => "text+Fx",
            "xtempobj" => "binary+Swx",
            "xtext" => "text+x",
            "xunicode" => "unicode+x",
            "xutf16" => "utf16+x",
            other => other,
        };
        let (base, mods) = match canonical.split_once('+') {
            Some((b, m)) => (b, m),
            None => (canonical, ""),
        };
        let base = match base {
            "text" => FileTypeBase::Text,
            "binary" => FileTypeBase::Binary,
            "symlink" => FileTypeBase::Symlink,
            "unicode" => FileTypeBase::Unicode,
            "utf8" => FileTypeBase::Utf8,
            "utf16" => FileTypeBase::Utf16,
            "apple" => FileTypeBase::Apple,
            "resource" => FileTypeBase::Resource,
            _ => return None,
        };
        let keywords = if mods.contains("ko") {
            KeywordMode::IdOnly
        } else if mods.contains('k') {
            KeywordMode::Full
        } else {
            KeywordMode::None
        };
        Some(FileType {
            base,
            executable: mods.contains('x'),
            keywords,
        })
    }

    /// Keyword expansion only applies to textual bases.
    pub fn keyword_mode(&self) -> KeywordMode {
        match self.base {
            FileTypeBase::Text | FileTypeBase::Unicode | FileTypeBase::Binary => self.keywords,
            _ => KeywordMode::None,
        }
    }
}

/// One file touched by a changelist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    /// Absolute depot path (wildcard-encoded, as the depot reports it).
    pub depot_path: String,
    pub revision: u32,
    pub action: FileAction,
    pub file_type: FileType,
    /// Set when the file belongs to a pending (shelved) change; content
    /// must then be fetched with the shelved-revision syntax.
    pub shelved_change: Option<u32>,
}

/// Normalized metadata for a single depot changelist. Immutable once
/// built; consumed exactly once by the stream writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: u32,
    pub author: String,
    /// Seconds since the epoch, as reported by the depot.
    pub timestamp: i64,
    pub description: String,
    pub files: Vec<FileChange>,
    /// Opaque job identifiers attached to the change; carried through,
    /// never interpreted.
    pub jobs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_and_modified_types() {
        let t = FileType::parse("text").unwrap();
        assert_eq!(t.base, FileTypeBase::Text);
        assert!(!t.executable);
        assert_eq!(t.keywords, KeywordMode::None);

        let t = FileType::parse("binary+x").unwrap();
        assert_eq!(t.base, FileTypeBase::Binary);
        assert!(t.executable);

        let t = FileType::parse("text+ko").unwrap();
        assert_eq!(t.keywords, KeywordMode::IdOnly);
    }

    #[test]
    fn historical_aliases_canonicalize() {
        let t = FileType::parse("ktext").unwrap();
        assert_eq!(t.base, FileTypeBase::Text);
        assert_eq!(t.keywords, KeywordMode::Full);

        let t = FileType::parse("xbinary").unwrap();
        assert_eq!(t.base, FileTypeBase::Binary);
        assert!(t.executable);
    }

    #[test]
    fn delete_actions() {
        assert!(FileAction::Delete.is_delete());
        assert!(FileAction::MoveDelete.is_delete());
        assert!(FileAction::Purge.is_delete());
        assert!(!FileAction::Edit.is_delete());
    }

    #[test]
    fn keyword_mode_ignored_for_symlinks() {
        let t = FileType {
            base: FileTypeBase::Symlink,
            executable: false,
            keywords: KeywordMode::Full,
        };
        assert_eq!(t.keyword_mode(), KeywordMode::None);
    }
}
