//! Overwrite conflict resolution
//!
//! [`decide`] is the pure decision table. [`ConflictResolver`] wraps it with
//! the prompt escalation, the non-interactive fallbacks and re-validation of
//! renamed targets.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::copy_param::{CopyParam, DefaultResolution, OverwritePolicy, TransferFlags};
use super::path_utils::alternative_name;
use crate::backend::{Capabilities, Capability};
use crate::error::TransferError;

/// Rename rounds before a conflict is reported unresolved
pub const MAX_RENAME_ROUNDS: u32 = 16;

/// Size/time of one side of a conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl FileSnapshot {
    pub fn new(name: impl Into<String>, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.into(),
            size,
            modified,
        }
    }

    /// Strictly newer; unknown times never compare as newer
    fn is_newer_than(&self, other: &FileSnapshot) -> bool {
        matches!((self.modified, other.modified), (Some(a), Some(b)) if a > b)
    }
}

/// Both sides of a conflict, as shown to the prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverwriteFileParams {
    pub source: FileSnapshot,
    pub destination: FileSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Overwrite,
    /// Append from the destination's current length
    Resume,
    Skip,
    /// Write to another name in the same directory
    Rename(String),
    /// Stop the whole batch
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Resolved(Resolution),
    /// Policy cannot decide; ask, with a suggested answer
    Escalate { suggested: Resolution },
}

/// Decision table for one file.
///
/// 1. no destination: overwrite
/// 2. `AlwaysOverwrite`: overwrite
/// 3. destination smaller, resume enabled for this size, backend can resume: resume
/// 4. `NeverOverwrite`: skip
/// 5. `OverwriteIfNewer` / `OverwriteIfDifferent`: compare
/// 6. otherwise escalate
pub fn decide(
    source: &FileSnapshot,
    destination: Option<&FileSnapshot>,
    param: &CopyParam,
    capabilities: Capabilities,
) -> Decision {
    let Some(destination) = destination else {
        return Decision::Resolved(Resolution::Overwrite);
    };

    if param.overwrite_policy == OverwritePolicy::AlwaysOverwrite {
        return Decision::Resolved(Resolution::Overwrite);
    }

    if destination.size < source.size
        && param.resume_enabled_for(source.size)
        && capabilities.supports(Capability::Resume)
    {
        return Decision::Resolved(Resolution::Resume);
    }

    match param.overwrite_policy {
        OverwritePolicy::NeverOverwrite => Decision::Resolved(Resolution::Skip),
        OverwritePolicy::OverwriteIfNewer => {
            if source.is_newer_than(destination) {
                Decision::Resolved(Resolution::Overwrite)
            } else {
                Decision::Resolved(Resolution::Skip)
            }
        }
        OverwritePolicy::OverwriteIfDifferent => {
            if source.size != destination.size || source.modified != destination.modified {
                Decision::Resolved(Resolution::Overwrite)
            } else {
                Decision::Resolved(Resolution::Skip)
            }
        }
        OverwritePolicy::Ask | OverwritePolicy::AlwaysOverwrite => {
            let suggested = if source.is_newer_than(destination) {
                Resolution::Overwrite
            } else {
                Resolution::Skip
            };
            Decision::Escalate { suggested }
        }
    }
}

/// Asks the user how to handle an existing destination.
#[async_trait]
pub trait ConflictPrompt: Send + Sync {
    async fn resolve(&self, params: &OverwriteFileParams, suggested: Resolution) -> Resolution;
}

/// Final answer for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Destination name to write (differs from the requested one after a rename)
    pub name: String,
    /// Never `Rename`
    pub resolution: Resolution,
    /// Destination snapshot the decision was based on
    pub destination: Option<FileSnapshot>,
}

pub struct ConflictResolver<'a> {
    param: &'a CopyParam,
    capabilities: Capabilities,
    flags: TransferFlags,
    prompt: Option<&'a dyn ConflictPrompt>,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(
        param: &'a CopyParam,
        capabilities: Capabilities,
        flags: TransferFlags,
        prompt: Option<&'a dyn ConflictPrompt>,
    ) -> Self {
        Self {
            param,
            capabilities,
            flags,
            prompt,
        }
    }

    fn interactive(&self) -> Option<&'a dyn ConflictPrompt> {
        if self.flags.contains(TransferFlags::NO_CONFIRMATION) {
            None
        } else {
            self.prompt
        }
    }

    /// Resolve the destination `name` for `source`.
    ///
    /// `lookup` stats a name in the destination directory (`None` when it
    /// does not exist). Renamed targets go through the table again.
    pub async fn resolve<F, Fut>(
        &self,
        source: &FileSnapshot,
        name: &str,
        mut lookup: F,
    ) -> Result<ResolvedTarget, TransferError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Option<FileSnapshot>>,
    {
        let mut name = name.to_string();

        for _ in 0..MAX_RENAME_ROUNDS {
            let destination = lookup(name.clone()).await;

            let resolution = match decide(source, destination.as_ref(), self.param, self.capabilities)
            {
                Decision::Resolved(resolution) => resolution,
                Decision::Escalate { suggested } => {
                    // Escalation only happens when the destination exists
                    let existing = destination.clone().unwrap_or_else(|| {
                        FileSnapshot::new(name.clone(), 0, None)
                    });
                    self.escalate(source, existing, &name, suggested, &mut lookup)
                        .await?
                }
            };

            match resolution {
                Resolution::Rename(new_name) => {
                    if !is_plain_name(&new_name) {
                        return Err(TransferError::UnresolvedConflict(format!(
                            "{}: {:?} is not a file name",
                            name, new_name
                        )));
                    }
                    debug!("Conflict on {} renamed to {}", name, new_name);
                    name = new_name;
                }
                Resolution::Resume => {
                    let resolution = self.validate_resume(source, destination.as_ref(), &name)?;
                    return Ok(ResolvedTarget {
                        name,
                        resolution,
                        destination,
                    });
                }
                resolution => {
                    return Ok(ResolvedTarget {
                        name,
                        resolution,
                        destination,
                    })
                }
            }
        }

        Err(TransferError::UnresolvedConflict(format!(
            "{}: no acceptable name after {} renames",
            source.name, MAX_RENAME_ROUNDS
        )))
    }

    async fn escalate<F, Fut>(
        &self,
        source: &FileSnapshot,
        destination: FileSnapshot,
        name: &str,
        suggested: Resolution,
        lookup: &mut F,
    ) -> Result<Resolution, TransferError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Option<FileSnapshot>>,
    {
        if let Some(prompt) = self.interactive() {
            let params = OverwriteFileParams {
                source: source.clone(),
                destination,
            };
            return Ok(prompt.resolve(&params, suggested).await);
        }

        match self.param.default_resolution {
            Some(DefaultResolution::Overwrite) => Ok(Resolution::Overwrite),
            Some(DefaultResolution::Resume) => Ok(Resolution::Resume),
            Some(DefaultResolution::Skip) => Ok(Resolution::Skip),
            Some(DefaultResolution::Abort) => Ok(Resolution::Abort),
            Some(DefaultResolution::AutoRename) => {
                Ok(Resolution::Rename(Self::free_name(name, lookup).await?))
            }
            None if self.flags.contains(TransferFlags::ALTERNATIVE_NAMING) => {
                Ok(Resolution::Rename(Self::free_name(name, lookup).await?))
            }
            None => Err(TransferError::UnresolvedConflict(name.to_string())),
        }
    }

    async fn free_name<F, Fut>(name: &str, lookup: &mut F) -> Result<String, TransferError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Option<FileSnapshot>>,
    {
        for n in 1..=MAX_RENAME_ROUNDS {
            let candidate = alternative_name(name, n);
            if lookup(candidate.clone()).await.is_none() {
                return Ok(candidate);
            }
        }
        Err(TransferError::UnresolvedConflict(format!(
            "{}: no free alternative name",
            name
        )))
    }

    /// A resume picked by the prompt or the default still has to be possible.
    fn validate_resume(
        &self,
        source: &FileSnapshot,
        destination: Option<&FileSnapshot>,
        name: &str,
    ) -> Result<Resolution, TransferError> {
        let Some(destination) = destination else {
            return Ok(Resolution::Overwrite);
        };

        if !self.capabilities.supports(Capability::Resume) {
            return if self.param.resume_fallback_overwrite {
                Ok(Resolution::Overwrite)
            } else {
                Err(TransferError::UnsupportedCapability(Capability::Resume))
            };
        }

        if destination.size > source.size {
            return if self.param.resume_fallback_overwrite {
                Ok(Resolution::Overwrite)
            } else {
                Err(TransferError::UnresolvedConflict(format!(
                    "{}: destination larger than source, cannot resume",
                    name
                )))
            };
        }

        Ok(Resolution::Resume)
    }
}

/// A rename answer must stay inside the target directory
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::copy_param::ResumeSupport;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn at(hour: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap())
    }

    fn param(policy: OverwritePolicy, resume: ResumeSupport) -> CopyParam {
        CopyParam {
            overwrite_policy: policy,
            resume_support: resume,
            ..Default::default()
        }
    }

    fn all() -> Capabilities {
        Capabilities::all()
    }

    #[test]
    fn test_missing_destination_overwrites() {
        let src = FileSnapshot::new("a", 10, at(1));
        let p = param(OverwritePolicy::NeverOverwrite, ResumeSupport::Off);
        assert_eq!(
            decide(&src, None, &p, all()),
            Decision::Resolved(Resolution::Overwrite)
        );
    }

    #[test]
    fn test_always_overwrite_beats_resume() {
        let src = FileSnapshot::new("a", 10, at(1));
        let dst = FileSnapshot::new("a", 5, at(1));
        let p = param(OverwritePolicy::AlwaysOverwrite, ResumeSupport::On);
        assert_eq!(
            decide(&src, Some(&dst), &p, all()),
            Decision::Resolved(Resolution::Overwrite)
        );
    }

    #[test]
    fn test_resume_requires_capability_and_threshold() {
        let src = FileSnapshot::new("a", 1000, at(1));
        let dst = FileSnapshot::new("a", 400, at(1));
        let p = param(
            OverwritePolicy::NeverOverwrite,
            ResumeSupport::Smart { threshold: 500 },
        );

        assert_eq!(
            decide(&src, Some(&dst), &p, all()),
            Decision::Resolved(Resolution::Resume)
        );
        assert_eq!(
            decide(&src, Some(&dst), &p, Capabilities::empty()),
            Decision::Resolved(Resolution::Skip)
        );

        let small = FileSnapshot::new("a", 499, at(1));
        let tiny = FileSnapshot::new("a", 10, at(1));
        assert_eq!(
            decide(&small, Some(&tiny), &p, all()),
            Decision::Resolved(Resolution::Skip)
        );
    }

    #[test]
    fn test_never_overwrite_skips_equal_or_larger() {
        let src = FileSnapshot::new("a", 10, at(2));
        let dst = FileSnapshot::new("a", 10, at(1));
        let p = param(OverwritePolicy::NeverOverwrite, ResumeSupport::On);
        assert_eq!(
            decide(&src, Some(&dst), &p, all()),
            Decision::Resolved(Resolution::Skip)
        );
    }

    #[test]
    fn test_if_newer_and_if_different() {
        let src = FileSnapshot::new("a", 10, at(3));
        let older = FileSnapshot::new("a", 10, at(2));
        let newer = FileSnapshot::new("a", 10, at(4));
        let same = FileSnapshot::new("a", 10, at(3));

        let p = param(OverwritePolicy::OverwriteIfNewer, ResumeSupport::Off);
        assert_eq!(
            decide(&src, Some(&older), &p, all()),
            Decision::Resolved(Resolution::Overwrite)
        );
        assert_eq!(
            decide(&src, Some(&newer), &p, all()),
            Decision::Resolved(Resolution::Skip)
        );

        let p = param(OverwritePolicy::OverwriteIfDifferent, ResumeSupport::Off);
        assert_eq!(
            decide(&src, Some(&same), &p, all()),
            Decision::Resolved(Resolution::Skip)
        );
        assert_eq!(
            decide(&src, Some(&newer), &p, all()),
            Decision::Resolved(Resolution::Overwrite)
        );
    }

    #[test]
    fn test_ask_escalates_with_suggestion() {
        let src = FileSnapshot::new("a", 10, at(3));
        let dst = FileSnapshot::new("a", 20, at(1));
        let p = param(OverwritePolicy::Ask, ResumeSupport::On);
        assert_eq!(
            decide(&src, Some(&dst), &p, all()),
            Decision::Escalate {
                suggested: Resolution::Overwrite
            }
        );

        let dst = FileSnapshot::new("a", 20, at(5));
        assert_eq!(
            decide(&src, Some(&dst), &p, all()),
            Decision::Escalate {
                suggested: Resolution::Skip
            }
        );
    }

    /// Destination directory stand-in for resolver tests
    fn existing(names: &[&str]) -> HashMap<String, FileSnapshot> {
        names
            .iter()
            .map(|n| (n.to_string(), FileSnapshot::new(*n, 50, at(9))))
            .collect()
    }

    struct ScriptedPrompt {
        answers: Mutex<Vec<Resolution>>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConflictPrompt for ScriptedPrompt {
        async fn resolve(&self, params: &OverwriteFileParams, _suggested: Resolution) -> Resolution {
            self.seen.lock().unwrap().push(params.destination.name.clone());
            self.answers.lock().unwrap().remove(0)
        }
    }

    #[tokio::test]
    async fn test_prompt_rename_is_revalidated() {
        let dir = existing(&["a.txt", "b.txt"]);
        let prompt = ScriptedPrompt {
            answers: Mutex::new(vec![
                Resolution::Rename("b.txt".into()),
                Resolution::Rename("c.txt".into()),
            ]),
            seen: Mutex::new(Vec::new()),
        };
        let p = param(OverwritePolicy::Ask, ResumeSupport::Off);
        let resolver = ConflictResolver::new(
            &p,
            all(),
            TransferFlags::empty(),
            Some(&prompt as &dyn ConflictPrompt),
        );

        let src = FileSnapshot::new("a.txt", 10, at(1));
        let target = resolver
            .resolve(&src, "a.txt", |n| {
                let found = dir.get(&n).cloned();
                async move { found }
            })
            .await
            .unwrap();

        assert_eq!(target.name, "c.txt");
        assert_eq!(target.resolution, Resolution::Overwrite);
        assert_eq!(*prompt.seen.lock().unwrap(), vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn test_non_interactive_without_default_is_unresolved() {
        let dir = existing(&["a.txt"]);
        let p = param(OverwritePolicy::Ask, ResumeSupport::Off);
        let resolver = ConflictResolver::new(&p, all(), TransferFlags::empty(), None);

        let src = FileSnapshot::new("a.txt", 10, at(1));
        let err = resolver
            .resolve(&src, "a.txt", |n| {
                let found = dir.get(&n).cloned();
                async move { found }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::UnresolvedConflict(_)));
    }

    #[tokio::test]
    async fn test_alternative_naming_picks_first_free() {
        let dir = existing(&["a.txt", "a (1).txt"]);
        let p = param(OverwritePolicy::Ask, ResumeSupport::Off);
        let resolver =
            ConflictResolver::new(&p, all(), TransferFlags::ALTERNATIVE_NAMING, None);

        let src = FileSnapshot::new("a.txt", 10, at(1));
        let target = resolver
            .resolve(&src, "a.txt", |n| {
                let found = dir.get(&n).cloned();
                async move { found }
            })
            .await
            .unwrap();
        assert_eq!(target.name, "a (2).txt");
        assert_eq!(target.resolution, Resolution::Overwrite);
    }

    #[tokio::test]
    async fn test_no_confirmation_ignores_prompt() {
        let dir = existing(&["a.txt"]);
        let prompt = ScriptedPrompt {
            answers: Mutex::new(vec![Resolution::Overwrite]),
            seen: Mutex::new(Vec::new()),
        };
        let p = CopyParam {
            default_resolution: Some(DefaultResolution::Skip),
            ..param(OverwritePolicy::Ask, ResumeSupport::Off)
        };
        let resolver = ConflictResolver::new(
            &p,
            all(),
            TransferFlags::NO_CONFIRMATION,
            Some(&prompt as &dyn ConflictPrompt),
        );

        let src = FileSnapshot::new("a.txt", 10, at(1));
        let target = resolver
            .resolve(&src, "a.txt", |n| {
                let found = dir.get(&n).cloned();
                async move { found }
            })
            .await
            .unwrap();
        assert_eq!(target.resolution, Resolution::Skip);
        assert!(prompt.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prompt_resume_without_capability_falls_back() {
        let dir = existing(&["a.txt"]);
        let prompt = ScriptedPrompt {
            answers: Mutex::new(vec![Resolution::Resume]),
            seen: Mutex::new(Vec::new()),
        };
        let p = CopyParam {
            resume_fallback_overwrite: true,
            ..param(OverwritePolicy::Ask, ResumeSupport::Off)
        };
        let resolver = ConflictResolver::new(
            &p,
            Capabilities::empty(),
            TransferFlags::empty(),
            Some(&prompt as &dyn ConflictPrompt),
        );

        let src = FileSnapshot::new("a.txt", 100, at(1));
        let target = resolver
            .resolve(&src, "a.txt", |n| {
                let found = dir.get(&n).cloned();
                async move { found }
            })
            .await
            .unwrap();
        assert_eq!(target.resolution, Resolution::Overwrite);
    }

    #[tokio::test]
    async fn test_prompt_resume_without_capability_fails_by_default() {
        let dir = existing(&["a.txt"]);
        let prompt = ScriptedPrompt {
            answers: Mutex::new(vec![Resolution::Resume]),
            seen: Mutex::new(Vec::new()),
        };
        let p = param(OverwritePolicy::Ask, ResumeSupport::Off);
        let resolver = ConflictResolver::new(
            &p,
            Capabilities::empty(),
            TransferFlags::empty(),
            Some(&prompt as &dyn ConflictPrompt),
        );

        let src = FileSnapshot::new("a.txt", 100, at(1));
        let err = resolver
            .resolve(&src, "a.txt", |n| {
                let found = dir.get(&n).cloned();
                async move { found }
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::UnsupportedCapability(Capability::Resume)
        ));
    }

    #[tokio::test]
    async fn test_prompt_rename_cannot_leave_directory() {
        for answer in ["../a.txt", "sub/a.txt", "..", ""] {
            let dir = existing(&["a.txt"]);
            let prompt = ScriptedPrompt {
                answers: Mutex::new(vec![Resolution::Rename(answer.into())]),
                seen: Mutex::new(Vec::new()),
            };
            let p = param(OverwritePolicy::Ask, ResumeSupport::Off);
            let resolver = ConflictResolver::new(
                &p,
                all(),
                TransferFlags::empty(),
                Some(&prompt as &dyn ConflictPrompt),
            );

            let src = FileSnapshot::new("a.txt", 10, at(1));
            let err = resolver
                .resolve(&src, "a.txt", |n| {
                    let found = dir.get(&n).cloned();
                    async move { found }
                })
                .await
                .unwrap_err();
            assert!(
                matches!(err, TransferError::UnresolvedConflict(_)),
                "{:?} accepted",
                answer
            );
        }
    }

    #[tokio::test]
    async fn test_endless_renames_are_bounded() {
        let dir = existing(&["x"]);
        struct Loop;
        #[async_trait]
        impl ConflictPrompt for Loop {
            async fn resolve(&self, _: &OverwriteFileParams, _: Resolution) -> Resolution {
                Resolution::Rename("x".into())
            }
        }
        let p = param(OverwritePolicy::Ask, ResumeSupport::Off);
        let resolver = ConflictResolver::new(
            &p,
            all(),
            TransferFlags::empty(),
            Some(&Loop as &dyn ConflictPrompt),
        );

        let src = FileSnapshot::new("x", 1, at(1));
        let err = resolver
            .resolve(&src, "x", |n| {
                let found = dir.get(&n).cloned();
                async move { found }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::UnresolvedConflict(_)));
    }
}
