//! Record lists saved by the vendor GUI.
//!
//! ```text
//! # exported shape
//! units = nm, urad
//! [3, 1000.0, 0.0, 0.0]
//! [9, -250.0, 12.5, 0.0]
//! ```
//!
//! Each record is `[segment, piston, tip, tilt]` in the vendor numbering. The
//! optional `units` header must precede the first record; without it the
//! adapter's default units apply. Parsed values are converted to device units
//! (µm, mrad).

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use tracing::debug;

use super::{parse_f64, CommandFormat, ParseError};
use crate::command::{Command, Ptt};
use crate::segment_map::{SegmentId, SegmentMap};
use crate::units::PttUnits;

/// Adapter for GUI export files.
#[derive(Debug, Clone)]
pub struct GuiExportFormat {
    map: SegmentMap,
    default_units: PttUnits,
}

impl GuiExportFormat {
    pub fn new(map: SegmentMap, default_units: PttUnits) -> Self {
        Self { map, default_units }
    }

    /// Read and parse a GUI export file.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Command, ParseError> {
        let path = path.as_ref();
        debug!("Loading GUI export {}", path.display());
        let text = fs::read_to_string(path)?;
        self.parse(&text)
    }

    fn parse_record(
        &self,
        body: &str,
        line: usize,
        units: PttUnits,
    ) -> Result<(SegmentId, Ptt), ParseError> {
        let fields: Vec<&str> = body.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(ParseError::malformed(
                line,
                format!(
                    "expected [segment, piston, tip, tilt], got {} fields",
                    fields.len()
                ),
            ));
        }

        let segment = fields[0]
            .parse::<u32>()
            .map(SegmentId)
            .map_err(|_| ParseError::malformed(line, format!("invalid segment '{}'", fields[0])))?;
        self.map.to_driver_channel(segment)?;

        let ptt = Ptt::new(
            parse_f64(fields[1], line, "piston")?,
            parse_f64(fields[2], line, "tip")?,
            parse_f64(fields[3], line, "tilt")?,
        );
        Ok((segment, ptt.to_device_units(units)))
    }
}

impl CommandFormat for GuiExportFormat {
    type Input = str;

    fn parse(&self, input: &str) -> Result<Command, ParseError> {
        let mut units = self.default_units;
        let mut seen = BTreeSet::new();
        let mut entries = Vec::new();

        for (index, raw) in input.lines().enumerate() {
            let line = index + 1;
            let text = raw.split('#').next().unwrap_or("").trim();
            if text.is_empty() {
                continue;
            }

            if let Some(value) = text
                .strip_prefix("units")
                .and_then(|rest| rest.trim_start().strip_prefix('='))
            {
                if !entries.is_empty() {
                    return Err(ParseError::malformed(line, "units header after first record"));
                }
                units = value
                    .trim()
                    .parse()
                    .map_err(|e: String| ParseError::malformed(line, e))?;
                continue;
            }

            let body = text
                .strip_prefix('[')
                .and_then(|t| t.strip_suffix(']'))
                .unwrap_or(text);
            let (segment, ptt) = self.parse_record(body, line, units)?;
            if !seen.insert(segment) {
                return Err(ParseError::DuplicateSegment(segment));
            }
            entries.push((segment, ptt));
        }

        debug!("Parsed {} GUI export records in {}", entries.len(), units);
        Ok(Command::device(entries))
    }
}
