//! Batch configuration
//!
//! [`CopyParam`] is fixed for the whole batch. [`TransferFlags`] select the
//! operation variant (copy/move, recursion, error handling).

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::backend::Rights;
use crate::error::TransferError;

/// What to do when the destination already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    AlwaysOverwrite,
    NeverOverwrite,
    /// Ask the conflict prompt (or fall back to the default resolution)
    Ask,
    /// Overwrite only when the source is strictly newer, else skip
    OverwriteIfNewer,
    /// Overwrite when size or modification time differ, else skip
    OverwriteIfDifferent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ResumeSupport {
    Off,
    On,
    /// Resume only files at least `threshold` bytes large
    Smart { threshold: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileNameCase {
    #[default]
    Preserve,
    Upper,
    Lower,
}

/// Resolution applied to conflicts when no prompt is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultResolution {
    Overwrite,
    Resume,
    Skip,
    /// First free `name (n).ext`
    AutoRename,
    Abort,
}

/// Characters most servers refuse in file names
pub const DEFAULT_INVALID_CHARS: &str = "\\:*?\"<>|";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyParam {
    pub overwrite_policy: OverwritePolicy,
    pub resume_support: ResumeSupport,
    /// Apply the source permissions to the destination
    pub preserve_rights: bool,
    /// Fixed permissions for every destination; wins over `preserve_rights`
    pub rights: Option<Rights>,
    pub preserve_time: bool,
    pub file_name_case: FileNameCase,
    /// Replace `invalid_chars` in destination names with `replacement_char`
    pub replace_invalid_chars: bool,
    pub invalid_chars: String,
    pub replacement_char: char,
    /// Glob masks on file names; empty means every file
    pub include_masks: Vec<String>,
    /// Glob masks on file and directory names
    pub exclude_masks: Vec<String>,
    /// Write to `<name>.filepart` and rename once complete
    pub use_part_file: bool,
    /// Overwrite from scratch when a resume attempt fails. Off, a failed
    /// resume leaves the existing destination bytes alone.
    pub resume_fallback_overwrite: bool,
    pub default_resolution: Option<DefaultResolution>,
}

impl Default for CopyParam {
    fn default() -> Self {
        Self {
            overwrite_policy: OverwritePolicy::Ask,
            resume_support: ResumeSupport::Smart {
                threshold: 100 * 1024,
            },
            preserve_rights: false,
            rights: None,
            preserve_time: true,
            file_name_case: FileNameCase::Preserve,
            replace_invalid_chars: false,
            invalid_chars: DEFAULT_INVALID_CHARS.to_string(),
            replacement_char: '_',
            include_masks: Vec::new(),
            exclude_masks: Vec::new(),
            use_part_file: true,
            resume_fallback_overwrite: false,
            default_resolution: None,
        }
    }
}

impl CopyParam {
    /// Whether resume applies to a source of `source_size` bytes
    pub fn resume_enabled_for(&self, source_size: u64) -> bool {
        match self.resume_support {
            ResumeSupport::Off => false,
            ResumeSupport::On => true,
            ResumeSupport::Smart { threshold } => source_size >= threshold,
        }
    }

    /// Destination name for a source name
    pub fn transform_name(&self, name: &str) -> String {
        let cased = match self.file_name_case {
            FileNameCase::Preserve => name.to_string(),
            FileNameCase::Upper => name.to_uppercase(),
            FileNameCase::Lower => name.to_lowercase(),
        };
        if !self.replace_invalid_chars {
            return cased;
        }
        cased
            .chars()
            .map(|c| {
                if self.invalid_chars.contains(c) || c.is_control() {
                    self.replacement_char
                } else {
                    c
                }
            })
            .collect()
    }

    /// Destination names equal source names, so distinct sources never
    /// share a destination
    pub fn keeps_names(&self) -> bool {
        self.file_name_case == FileNameCase::Preserve && !self.replace_invalid_chars
    }

    /// Rights to apply to a destination, if any
    pub fn rights_for(&self, source: Option<Rights>) -> Option<Rights> {
        self.rights
            .or(if self.preserve_rights { source } else { None })
    }

    pub fn compile_filter(&self) -> Result<FileFilter, TransferError> {
        let compile = |masks: &[String]| {
            masks
                .iter()
                .map(|m| {
                    Pattern::new(m)
                        .map_err(|e| TransferError::Config(format!("invalid mask {:?}: {}", m, e)))
                })
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(FileFilter {
            include: compile(&self.include_masks)?,
            exclude: compile(&self.exclude_masks)?,
        })
    }
}

/// Compiled include/exclude masks
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl FileFilter {
    const OPTIONS: MatchOptions = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    /// Include masks only restrict files; directories are always walked
    /// unless excluded.
    pub fn accepts(&self, name: &str, is_directory: bool) -> bool {
        if self
            .exclude
            .iter()
            .any(|p| p.matches_with(name, Self::OPTIONS))
        {
            return false;
        }
        is_directory
            || self.include.is_empty()
            || self
                .include
                .iter()
                .any(|p| p.matches_with(name, Self::OPTIONS))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransferFlags(u32);

bitflags::bitflags! {
    impl TransferFlags: u32 {
        /// Directories in the source list fail instead of being expanded
        const NO_RECURSIVE = 0x01;
        /// Delete each source once its copy is confirmed
        const MOVE = 0x02;
        /// Remove moved source directories even if skipped entries remain
        const FORCE_DELETE = 0x04;
        /// Resolve unanswered conflicts by picking a free `name (n).ext`
        const ALTERNATIVE_NAMING = 0x08;
        const STOP_ON_FIRST_ERROR = 0x10;
        /// Never consult the conflict prompt
        const NO_CONFIRMATION = 0x20;
        /// The target directory was just created; skip conflict checks there
        const NEW_DIRECTORY = 0x40;
    }
}

impl TransferFlags {
    pub fn from_raw(bits: u32) -> Self {
        Self::from_bits_retain(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_threshold() {
        let mut param = CopyParam {
            resume_support: ResumeSupport::Smart { threshold: 1000 },
            ..Default::default()
        };
        assert!(!param.resume_enabled_for(999));
        assert!(param.resume_enabled_for(1000));

        param.resume_support = ResumeSupport::Off;
        assert!(!param.resume_enabled_for(u64::MAX));
    }

    #[test]
    fn test_transform_name() {
        let param = CopyParam {
            file_name_case: FileNameCase::Lower,
            replace_invalid_chars: true,
            ..Default::default()
        };
        assert_eq!(param.transform_name("Report:Q1?.TXT"), "report_q1_.txt");
        assert_eq!(CopyParam::default().transform_name("A:b"), "A:b");
    }

    #[test]
    fn test_filter() {
        let param = CopyParam {
            include_masks: vec!["*.log".into()],
            exclude_masks: vec!["tmp*".into()],
            ..Default::default()
        };
        let filter = param.compile_filter().unwrap();
        assert!(filter.accepts("app.log", false));
        assert!(!filter.accepts("app.txt", false));
        assert!(!filter.accepts("tmp.log", false));
        assert!(filter.accepts("logs", true));
        assert!(!filter.accepts("tmpdir", true));
    }

    #[test]
    fn test_invalid_mask_is_config_error() {
        let param = CopyParam {
            exclude_masks: vec!["[".into()],
            ..Default::default()
        };
        assert!(matches!(
            param.compile_filter(),
            Err(TransferError::Config(_))
        ));
    }

    #[test]
    fn test_rights_override_wins() {
        let mut param = CopyParam {
            preserve_rights: true,
            ..Default::default()
        };
        assert_eq!(
            param.rights_for(Some(Rights::new(0o600))),
            Some(Rights::new(0o600))
        );
        param.rights = Some(Rights::new(0o644));
        assert_eq!(
            param.rights_for(Some(Rights::new(0o600))),
            Some(Rights::new(0o644))
        );
        param.preserve_rights = false;
        param.rights = None;
        assert_eq!(param.rights_for(Some(Rights::new(0o600))), None);
    }

    #[test]
    fn test_unknown_flag_bits_kept() {
        let flags = TransferFlags::from_raw(0x8000_0000 | 0x02);
        assert!(flags.contains(TransferFlags::MOVE));
        assert_eq!(flags.bits() & 0x8000_0000, 0x8000_0000);
    }

    #[test]
    fn test_serde_defaults() {
        let param: CopyParam = serde_json::from_str(r#"{"overwrite_policy":"never_overwrite"}"#).unwrap();
        assert_eq!(param.overwrite_policy, OverwritePolicy::NeverOverwrite);
        assert!(param.use_part_file);
    }
}
