//! Cache configuration from flags and environment

use std::path::PathBuf;

use pack_cache::CachingOptions;

use crate::error::{CliError, Result};

const DEFAULT_MAX_CACHE_SIZE: u64 = 5 * 1024 * 1024 * 1024; // 5GB
const DEFAULT_LIST_CACHE_SECS: u64 = 30;

/// Parse a size like "500M", "10G" or plain bytes
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, multiplier) = match s.as_bytes().last() {
        Some(b'K' | b'k') => (&s[..s.len() - 1], 1024u64),
        Some(b'M' | b'm') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'G' | b'g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some(b'T' | b't') => (&s[..s.len() - 1], 1024 * 1024 * 1024 * 1024),
        _ => (s, 1u64),
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid size: '{s}'"))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("invalid size: '{s}'"));
    }
    Ok((num * multiplier as f64) as u64)
}

/// Build caching options, preferring explicit flags over the environment.
///
/// `lookup` abstracts `std::env::var` so the precedence can be tested.
pub fn load_options<F>(
    cache_dir: Option<PathBuf>,
    max_size: Option<u64>,
    lookup: F,
) -> Result<CachingOptions>
where
    F: Fn(&str) -> Option<String>,
{
    let cache_directory = cache_dir
        .or_else(|| lookup("PACK_CACHE_DIR").map(PathBuf::from))
        .ok_or_else(|| {
            CliError::Config("no cache directory (use --cache-dir or PACK_CACHE_DIR)".to_string())
        })?;

    let max_cache_size_bytes = match max_size {
        Some(size) => size,
        None => match lookup("PACK_CACHE_MAX_SIZE") {
            Some(s) => parse_size(&s).map_err(CliError::Config)?,
            None => DEFAULT_MAX_CACHE_SIZE,
        },
    };

    let max_list_cache_duration_secs = match lookup("PACK_CACHE_LIST_TTL_SECS") {
        Some(s) => s.trim().parse::<u64>().map_err(|_| {
            CliError::Config(format!("invalid PACK_CACHE_LIST_TTL_SECS: '{}'", s))
        })?,
        None => DEFAULT_LIST_CACHE_SECS,
    };

    Ok(CachingOptions {
        cache_directory: Some(cache_directory),
        max_cache_size_bytes,
        max_list_cache_duration_secs,
        hmac_secret: Vec::new(),
    })
}
