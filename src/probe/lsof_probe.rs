//! Port lookup through `lsof`, for Unix systems without procfs sockets

use std::collections::BTreeSet;
use std::process::Command;

use crate::error::ProbeError;

pub fn find_owners(port: u16) -> Result<BTreeSet<u32>, ProbeError> {
    let lsof = which::which("lsof").map_err(|e| ProbeError::ToolMissing(format!("lsof: {e}")))?;

    let output = Command::new(lsof)
        .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output()
        .map_err(|e| ProbeError::Command(format!("failed to execute lsof: {e}")))?;

    // lsof exits 1 both for "nothing matched" and for real failures;
    // only the latter writes to stderr.
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.trim().is_empty() && stderr.trim().is_empty() {
            return Ok(BTreeSet::new());
        }
        if stdout.trim().is_empty() {
            return Err(ProbeError::Command(format!("lsof: {}", stderr.trim())));
        }
    }

    Ok(parse_pids(&stdout))
}

/// One pid per line, as printed by `lsof -t`.
pub(crate) fn parse_pids(stdout: &str) -> BTreeSet<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid > 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pids() {
        assert_eq!(parse_pids("123\n456\n123\n"), BTreeSet::from([123, 456]));
        assert!(parse_pids("").is_empty());
        assert_eq!(parse_pids("  77 \nwarning: blah\n"), BTreeSet::from([77]));
    }
}
