// src/lib.rs

use regex::escape;

pub mod collect;
pub mod config;
pub mod constants;
pub mod csv_export;
pub mod extrapolate;
pub mod kbbench;
pub mod normalize;
pub mod parse;
pub mod perftest;
pub mod probe;
pub mod results_dir;
pub mod stability;
pub mod trial;

/// Converts a simple glob (with `*`) into a fully-anchored regex string.
pub fn glob_to_regex(glob: &str) -> String {
    format!("^{}$", escape(glob).replace(r"\*", ".*"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_to_regex() {
        let re = regex::Regex::new(&glob_to_regex("*_kbbench_results_*.csv")).unwrap();
        assert!(re.is_match("KingbaseES_kbbench_results_20250101_000000.csv"));
        assert!(!re.is_match("KingbaseES_kbbench_results_20250101_000000.csv.bak"));
        assert!(!re.is_match("perftest_summary.csv"));
    }
}
