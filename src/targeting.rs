use std::collections::BTreeSet;

use globset::Glob;

use crate::error::{DispatchError, Result};

/// True if `pattern` contains glob syntax rather than naming one agent.
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Resolve target patterns against the agents currently known.
///
/// Literal ids are kept even if no such agent is connected, so they time out
/// like any other silent target. Glob patterns (`web-*`, `db-[12]`) expand
/// to the matching known ids and may match nothing.
pub fn expand_targets<P, S>(patterns: P, known: &[String]) -> Result<BTreeSet<String>>
where
    P: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut targets = BTreeSet::new();

    for pattern in patterns {
        let pattern = pattern.as_ref().trim();
        if pattern.is_empty() {
            continue;
        }
        if !is_glob(pattern) {
            targets.insert(pattern.to_string());
            continue;
        }

        let matcher = Glob::new(pattern)
            .map_err(|e| DispatchError::InvalidTarget(format!("{}: {}", pattern, e)))?
            .compile_matcher();
        let before = targets.len();
        targets.extend(known.iter().filter(|id| matcher.is_match(id.as_str())).cloned());
        if targets.len() == before {
            tracing::debug!(pattern, "Target pattern matched no agents");
        }
    }

    Ok(targets)
}
