//! VM options that control stack walking.
//!
//! Parsed once at VM start from `-XX:` style arguments:
//!
//! ```text
//! -XX:+TraceStackWalk               trace every frame walked
//! -XX:+VerifyRefMaps                check every marked slot holds a reference
//! -XX:LogSRSSuppressionCount=<n>    skip logging of the first n stack root scans
//! -XX:MaxFramesDisplay=<n>          frames shown by a stack dump before truncating
//! ```
//!
//! `-XX:-Flag` turns a boolean option off. Arguments not starting with `-XX:`
//! belong to someone else and are ignored.

use alloc::format;
use alloc::string::String;
use core::fmt;

/// A malformed or unknown option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionError(String);

impl fmt::Display for OptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const PREFIX: &str = "-XX:";

pub const DEFAULT_MAX_FRAMES_DISPLAY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub trace_stack_walk: bool,
    pub verify_ref_maps: bool,
    pub log_suppression_count: usize,
    pub max_frames_display: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            trace_stack_walk: false,
            verify_ref_maps: false,
            log_suppression_count: 0,
            max_frames_display: DEFAULT_MAX_FRAMES_DISPLAY,
        }
    }
}

impl Options {
    pub fn parse<I, S>(args: I) -> Result<Self, OptionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Options::default();
        for arg in args {
            let arg = arg.as_ref();
            let Some(option) = arg.strip_prefix(PREFIX) else {
                continue;
            };
            options.apply(option)?;
        }
        Ok(options)
    }

    fn apply(&mut self, option: &str) -> Result<(), OptionError> {
        if let Some((name, value)) = option.split_once('=') {
            let value = parse_count(name, value)?;
            match name {
                "LogSRSSuppressionCount" => self.log_suppression_count = value,
                "MaxFramesDisplay" => {
                    if value == 0 {
                        return Err(OptionError(format!("{PREFIX}{name} must be at least 1")));
                    }
                    self.max_frames_display = value;
                }
                _ => return Err(unknown(option)),
            }
            return Ok(());
        }

        let (enabled, name) = match option.as_bytes().first() {
            Some(b'+') => (true, &option[1..]),
            Some(b'-') => (false, &option[1..]),
            _ => {
                return Err(OptionError(format!(
                    "{PREFIX}{option}: boolean options take a + or - prefix"
                )))
            }
        };
        match name {
            "TraceStackWalk" => self.trace_stack_walk = enabled,
            "VerifyRefMaps" => self.verify_ref_maps = enabled,
            _ => return Err(unknown(option)),
        }
        Ok(())
    }
}

fn parse_count(name: &str, value: &str) -> Result<usize, OptionError> {
    value
        .parse()
        .map_err(|e| OptionError(format!("{PREFIX}{name}: invalid value {value:?}: {e}")))
}

fn unknown(option: &str) -> OptionError {
    OptionError(format!("unknown option {PREFIX}{option}"))
}
