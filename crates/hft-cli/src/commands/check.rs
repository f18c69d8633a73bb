//! `hftctl check`: validate a rule file without starting anything.

use anyhow::{bail, Result};
use hft_core::{load_rules, HftError};
use std::path::Path;
use tracing::debug;

/// Parse `path` and print its rules, or every problem found in it.
pub fn run(path: &Path) -> Result<()> {
    debug!(path = %path.display(), "checking rule file");

    let rules = match load_rules(path) {
        Ok(rules) => rules,
        Err(HftError::RulesRejected(problems)) => {
            for problem in &problems {
                eprintln!("  {problem}");
            }
            bail!("{} rejected: {} problem(s)", path.display(), problems.len());
        }
        Err(e) => return Err(e.into()),
    };

    if rules.is_empty() {
        bail!("{} contains no rules", path.display());
    }

    for rule in &rules {
        println!("{rule}");
    }
    println!("\n{} rule(s) OK.", rules.len());
    Ok(())
}
