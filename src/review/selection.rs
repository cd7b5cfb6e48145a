//! Which reviewers a cycle needs.
//!
//! Correctness reviewers always run on a task. Security and style reviewers
//! are added when a file-scope path matches one of their glob patterns.
//! Milestone reviews use `milestone` reviewers and fall back to correctness.

use std::sync::Arc;

use foreman_common::{Reviewer, ReviewerRole};
use glob::{MatchOptions, Pattern, PatternError};

use super::ReviewGap;

pub const DEFAULT_SECURITY_PATTERNS: &[&str] = &[
    "**/auth/**",
    "**/*auth*",
    "**/security/**",
    "**/*crypto*",
    "**/*secret*",
    "**/*token*",
    "**/*session*",
    "**/*password*",
    "**/*permission*",
    "**/migrations/**",
    "**/*.sql",
];

pub const DEFAULT_STYLE_PATTERNS: &[&str] = &[
    "**/*.css",
    "**/*.scss",
    "**/*.html",
    "**/*.tsx",
    "**/*.jsx",
    "**/*.vue",
    "**/*.svelte",
    "**/components/**",
    "**/ui/**",
    "**/templates/**",
    "**/styles/**",
];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Compiled routing patterns for the conditional reviewer roles.
#[derive(Debug, Clone)]
pub struct Routing {
    security: Vec<Pattern>,
    style: Vec<Pattern>,
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            security: compile_builtin(DEFAULT_SECURITY_PATTERNS),
            style: compile_builtin(DEFAULT_STYLE_PATTERNS),
        }
    }
}

fn compile_builtin(patterns: &[&str]) -> Vec<Pattern> {
    patterns.iter().filter_map(|p| Pattern::new(p).ok()).collect()
}

fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Pattern>, PatternError> {
    patterns.iter().map(|p| Pattern::new(p.as_ref())).collect()
}

impl Routing {
    pub fn new<S: AsRef<str>>(security: &[S], style: &[S]) -> Result<Self, PatternError> {
        Ok(Self {
            security: compile(security)?,
            style: compile(style)?,
        })
    }

    /// Roles a task touching `paths` must be reviewed by.
    pub fn required_roles<S: AsRef<str>>(&self, paths: &[S]) -> Vec<ReviewerRole> {
        let mut roles = vec![ReviewerRole::Correctness];
        if any_match(&self.security, paths) {
            roles.push(ReviewerRole::Security);
        }
        if any_match(&self.style, paths) {
            roles.push(ReviewerRole::Style);
        }
        roles
    }
}

fn any_match<S: AsRef<str>>(patterns: &[Pattern], paths: &[S]) -> bool {
    paths.iter().any(|path| {
        let path = path.as_ref().trim_start_matches("./");
        patterns.iter().any(|p| p.matches_with(path, MATCH_OPTIONS))
    })
}

/// Reviewers picked for one cycle plus the roles nobody covers.
pub struct Selection {
    pub reviewers: Vec<Arc<dyn Reviewer>>,
    pub gaps: Vec<ReviewGap>,
}

impl Selection {
    pub fn ids(&self) -> Vec<String> {
        self.reviewers.iter().map(|r| r.id().to_string()).collect()
    }
}

/// Every configured reviewer whose role is in `roles`. A required role with
/// no configured reviewer becomes a gap.
pub fn select(pool: &[Arc<dyn Reviewer>], roles: &[ReviewerRole]) -> Selection {
    let mut reviewers = Vec::new();
    let mut gaps = Vec::new();
    for role in roles {
        let matching: Vec<_> = pool.iter().filter(|r| r.role() == *role).cloned().collect();
        if matching.is_empty() {
            gaps.push(ReviewGap::missing_role(*role));
        }
        reviewers.extend(matching);
    }
    Selection { reviewers, gaps }
}

/// Milestone reviewers, or correctness reviewers when none is configured.
pub fn select_for_milestone(pool: &[Arc<dyn Reviewer>]) -> Selection {
    let milestone = select(pool, &[ReviewerRole::Milestone]);
    if !milestone.reviewers.is_empty() {
        return milestone;
    }
    select(pool, &[ReviewerRole::Correctness])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::tests::Scripted;
    use foreman_common::ReviewVerdict;

    #[test]
    fn correctness_is_always_required() {
        let routing = Routing::default();
        assert_eq!(routing.required_roles(&["src/lib.rs"]), vec![ReviewerRole::Correctness]);
    }

    #[test]
    fn sensitive_and_presentation_paths_add_roles() {
        let routing = Routing::default();
        assert_eq!(
            routing.required_roles(&["src/auth/login.rs", "web/components/Button.tsx"]),
            vec![ReviewerRole::Correctness, ReviewerRole::Security, ReviewerRole::Style]
        );
        assert!(routing
            .required_roles(&["db/migrations/001_init.sql"])
            .contains(&ReviewerRole::Security));
    }

    #[test]
    fn custom_patterns_replace_defaults() {
        let routing = Routing::new(&["payments/**"], &[]).unwrap();
        assert!(routing.required_roles(&["payments/charge.rs"]).contains(&ReviewerRole::Security));
        assert_eq!(routing.required_roles(&["src/auth.rs"]), vec![ReviewerRole::Correctness]);
        assert!(Routing::new(&["[unclosed"], &[]).is_err());
    }

    #[test]
    fn missing_roles_become_gaps() {
        let pool: Vec<Arc<dyn Reviewer>> = vec![Arc::new(Scripted::new(
            "correctness",
            ReviewerRole::Correctness,
            ReviewVerdict::Pass,
        ))];
        let selection = select(&pool, &[ReviewerRole::Correctness, ReviewerRole::Security]);
        assert_eq!(selection.ids(), vec!["correctness"]);
        assert_eq!(selection.gaps.len(), 1);
        assert_eq!(selection.gaps[0].reviewer, "role:security");
    }

    #[test]
    fn milestone_review_falls_back_to_correctness() {
        let pool: Vec<Arc<dyn Reviewer>> = vec![Arc::new(Scripted::new(
            "correctness",
            ReviewerRole::Correctness,
            ReviewVerdict::Pass,
        ))];
        let selection = select_for_milestone(&pool);
        assert_eq!(selection.ids(), vec!["correctness"]);
        assert!(selection.gaps.is_empty());
    }
}
