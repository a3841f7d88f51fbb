//! INI-style command file consumed by the driver executable.
//!
//! ```text
//! [Param]
//! MirrorSerial = PWA37-05-04-0404
//! DriverSerial = 09160017
//! nbSegment = 7
//!
//! [Segment3]
//! Enable = 1
//! Piston = 1
//! Tip = 0
//! Tilt = 0
//! ```
//!
//! One `[Segment<channel>]` section per pupil segment, in pupil order. The
//! format is positional and complete: unused segments carry the flat value
//! and disabled segments are written with `Enable = 0`. Values are in device
//! units and use the shortest representation that parses back to the same
//! `f64`, so parsing a serialized file reproduces it exactly.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;

use tracing::debug;

use super::{parse_f64, CommandFormat, ParseError};
use crate::command::{Command, Ptt};
use crate::segment_map::{DriverChannel, SegmentMap};

const PARAM_SECTION: &str = "Param";
const SEGMENT_PREFIX: &str = "Segment";

/// `[Param]` section of a device-native file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NativeHeader {
    pub mirror_serial: String,
    pub driver_serial: String,
}

/// One `[Segment<channel>]` section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NativeRecord {
    pub channel: DriverChannel,
    pub enabled: bool,
    /// Device units (µm, mrad)
    pub ptt: Ptt,
}

/// Complete contents of a device-native file.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeRecordSet {
    pub header: NativeHeader,
    pub records: Vec<NativeRecord>,
}

/// Build the record set the driver needs to hold `command`.
///
/// Emits one record per pupil segment in pupil order. Segments the command
/// leaves unused take their value from `flat`.
pub fn serialize(
    command: &Command,
    map: &SegmentMap,
    flat: &Command,
    header: NativeHeader,
) -> NativeRecordSet {
    let resolved = command.resolved(map, flat);
    let flat = flat.to_device_units();

    let records = map
        .iter()
        .map(|(segment, channel)| {
            let enabled = map.is_enabled(segment);
            let ptt = if enabled {
                resolved.get(segment)
            } else {
                flat.get(segment)
            };
            NativeRecord {
                channel,
                enabled,
                ptt: ptt.unwrap_or(Ptt::ZERO),
            }
        })
        .collect();

    NativeRecordSet { header, records }
}

impl NativeRecordSet {
    /// Text of the file, exactly as written to disk.
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Write the file, replacing any previous contents.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let path = path.as_ref();
        fs::write(path, self.render())?;
        debug!(
            "Wrote {} segment records to {}",
            self.records.len(),
            path.display()
        );
        Ok(())
    }

    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Self, ParseError> {
        let text = fs::read_to_string(path)?;
        Self::parse_str(&text)
    }

    /// Parse the text of a device-native file.
    pub fn parse_str(text: &str) -> Result<Self, ParseError> {
        let mut parser = Parser::default();
        for (index, raw) in text.lines().enumerate() {
            parser.feed(index + 1, raw)?;
        }
        parser.finish()
    }
}

impl fmt::Display for NativeRecordSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{PARAM_SECTION}]")?;
        writeln!(f, "MirrorSerial = {}", self.header.mirror_serial)?;
        writeln!(f, "DriverSerial = {}", self.header.driver_serial)?;
        writeln!(f, "nbSegment = {}", self.records.len())?;
        for record in &self.records {
            writeln!(f)?;
            writeln!(f, "[{SEGMENT_PREFIX}{}]", record.channel)?;
            writeln!(f, "Enable = {}", u8::from(record.enabled))?;
            writeln!(f, "Piston = {}", record.ptt.piston)?;
            writeln!(f, "Tip = {}", record.ptt.tip)?;
            writeln!(f, "Tilt = {}", record.ptt.tilt)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PendingRecord {
    channel: u32,
    line: usize,
    enabled: Option<bool>,
    piston: Option<f64>,
    tip: Option<f64>,
    tilt: Option<f64>,
}

impl PendingRecord {
    fn set(&mut self, line: usize, key: &str, value: &str) -> Result<(), ParseError> {
        let slot = match key {
            "Enable" => {
                let enabled = match value {
                    "1" => true,
                    "0" => false,
                    other => {
                        return Err(ParseError::malformed(
                            line,
                            format!("Enable must be 0 or 1, got '{other}'"),
                        ))
                    }
                };
                return set_once(&mut self.enabled, enabled, line, key);
            }
            "Piston" => &mut self.piston,
            "Tip" => &mut self.tip,
            "Tilt" => &mut self.tilt,
            other => {
                return Err(ParseError::malformed(
                    line,
                    format!("unknown segment key '{other}'"),
                ))
            }
        };
        let value = parse_f64(value, line, key)?;
        set_once(slot, value, line, key)
    }

    fn finish(self) -> Result<NativeRecord, ParseError> {
        let missing = |key: &str| {
            ParseError::malformed(
                self.line,
                format!("{SEGMENT_PREFIX}{} is missing '{key}'", self.channel),
            )
        };
        Ok(NativeRecord {
            channel: DriverChannel(self.channel),
            enabled: self.enabled.ok_or_else(|| missing("Enable"))?,
            ptt: Ptt::new(
                self.piston.ok_or_else(|| missing("Piston"))?,
                self.tip.ok_or_else(|| missing("Tip"))?,
                self.tilt.ok_or_else(|| missing("Tilt"))?,
            ),
        })
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, line: usize, key: &str) -> Result<(), ParseError> {
    if slot.is_some() {
        return Err(ParseError::malformed(line, format!("duplicate key '{key}'")));
    }
    *slot = Some(value);
    Ok(())
}

#[derive(Debug)]
enum Section {
    Preamble,
    Param,
    Segment(PendingRecord),
}

#[derive(Debug)]
struct Parser {
    section: Section,
    seen_param: bool,
    mirror_serial: Option<String>,
    driver_serial: Option<String>,
    declared: Option<usize>,
    channels: BTreeSet<u32>,
    records: Vec<NativeRecord>,
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            section: Section::Preamble,
            seen_param: false,
            mirror_serial: None,
            driver_serial: None,
            declared: None,
            channels: BTreeSet::new(),
            records: Vec::new(),
        }
    }
}

impl Parser {
    fn feed(&mut self, line: usize, raw: &str) -> Result<(), ParseError> {
        let text = raw.trim();
        if text.is_empty() || text.starts_with(';') || text.starts_with('#') {
            return Ok(());
        }

        if let Some(name) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            return self.open_section(line, name.trim());
        }

        let (key, value) = text
            .split_once('=')
            .ok_or_else(|| ParseError::malformed(line, format!("expected 'key = value', got '{text}'")))?;
        let (key, value) = (key.trim(), value.trim());

        match &mut self.section {
            Section::Preamble => Err(ParseError::malformed(line, "key outside of any section")),
            Section::Segment(pending) => pending.set(line, key, value),
            Section::Param => match key {
                "MirrorSerial" => set_once(&mut self.mirror_serial, value.to_string(), line, key),
                "DriverSerial" => set_once(&mut self.driver_serial, value.to_string(), line, key),
                "nbSegment" => {
                    let count = value.parse::<usize>().map_err(|_| {
                        ParseError::malformed(line, format!("invalid nbSegment '{value}'"))
                    })?;
                    set_once(&mut self.declared, count, line, key)
                }
                other => Err(ParseError::malformed(
                    line,
                    format!("unknown parameter '{other}'"),
                )),
            },
        }
    }

    fn open_section(&mut self, line: usize, name: &str) -> Result<(), ParseError> {
        self.close_section()?;

        if name == PARAM_SECTION {
            if self.seen_param {
                return Err(ParseError::malformed(line, "duplicate [Param] section"));
            }
            self.seen_param = true;
            self.section = Section::Param;
            return Ok(());
        }

        let channel = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| ParseError::malformed(line, format!("unknown section [{name}]")))?;
        if !self.channels.insert(channel) {
            return Err(ParseError::DuplicateChannel(DriverChannel(channel)));
        }
        self.section = Section::Segment(PendingRecord {
            channel,
            line,
            ..PendingRecord::default()
        });
        Ok(())
    }

    fn close_section(&mut self) -> Result<(), ParseError> {
        if let Section::Segment(pending) = std::mem::replace(&mut self.section, Section::Preamble) {
            self.records.push(pending.finish()?);
        }
        Ok(())
    }

    fn finish(mut self) -> Result<NativeRecordSet, ParseError> {
        self.close_section()?;

        let missing = |key: &str| ParseError::malformed(0, format!("[Param] is missing '{key}'"));
        let header = NativeHeader {
            mirror_serial: self.mirror_serial.ok_or_else(|| missing("MirrorSerial"))?,
            driver_serial: self.driver_serial.ok_or_else(|| missing("DriverSerial"))?,
        };
        let declared = self.declared.ok_or_else(|| missing("nbSegment"))?;
        if declared != self.records.len() {
            return Err(ParseError::SegmentCount {
                declared,
                found: self.records.len(),
            });
        }

        Ok(NativeRecordSet {
            header,
            records: self.records,
        })
    }
}

/// Adapter for device-native files.
///
/// Channels are mapped back to segments through the [`SegmentMap`];
/// disabled records carry no command and are skipped.
#[derive(Debug, Clone)]
pub struct DeviceNativeFormat {
    map: SegmentMap,
}

impl DeviceNativeFormat {
    pub fn new(map: SegmentMap) -> Self {
        Self { map }
    }

    /// Build a command from already-parsed records.
    pub fn parse_records(&self, records: &NativeRecordSet) -> Result<Command, ParseError> {
        let mut entries = Vec::with_capacity(records.records.len());
        for record in &records.records {
            let segment = self.map.from_driver_channel(record.channel)?;
            if record.enabled && self.map.is_enabled(segment) {
                entries.push((segment, record.ptt));
            }
        }
        Ok(Command::device(entries))
    }

    /// Read and parse a device-native file.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Command, ParseError> {
        let path = path.as_ref();
        debug!("Loading device-native file {}", path.display());
        self.parse_records(&NativeRecordSet::read_from(path)?)
    }
}

impl CommandFormat for DeviceNativeFormat {
    type Input = str;

    fn parse(&self, input: &str) -> Result<Command, ParseError> {
        self.parse_records(&NativeRecordSet::parse_str(input)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment_map::{MapError, SegmentId};
    use crate::units::{PistonUnit, PttUnits, TiltUnit};

    fn map() -> SegmentMap {
        let pupil = [3, 9, 10, 11, 4, 1, 2].into_iter().map(SegmentId).collect();
        SegmentMap::new(37, pupil, None).unwrap()
    }

    fn header() -> NativeHeader {
        NativeHeader {
            mirror_serial: "PWA37-05-04-0404".to_string(),
            driver_serial: "09160017".to_string(),
        }
    }

    fn flat() -> Command {
        Command::device([])
    }

    #[test]
    fn test_serialize_writes_every_pupil_segment_in_order() {
        let command = Command::device([(SegmentId(10), Ptt::new(0.5, 0.1, -0.1))]);
        let set = serialize(&command, &map(), &flat(), header());

        let channels: Vec<u32> = set.records.iter().map(|r| r.channel.0).collect();
        assert_eq!(channels, vec![3, 9, 10, 11, 4, 1, 2]);
        assert_eq!(set.records[2].ptt, Ptt::new(0.5, 0.1, -0.1));
        assert!(set.records.iter().all(|r| r.enabled));
        assert!(set
            .records
            .iter()
            .filter(|r| r.channel != DriverChannel(10))
            .all(|r| r.ptt == Ptt::ZERO));
    }

    #[test]
    fn test_unused_segments_take_flat_value() {
        let flat = Command::device([(SegmentId(1), Ptt::new(0.05, 0.0, 0.01))]);
        let set = serialize(&Command::device([]), &map(), &flat, header());
        let center = set
            .records
            .iter()
            .find(|r| r.channel == DriverChannel(1))
            .unwrap();
        assert_eq!(center.ptt, Ptt::new(0.05, 0.0, 0.01));
    }

    #[test]
    fn test_render_layout() {
        let pupil = vec![SegmentId(1), SegmentId(2)];
        let map = SegmentMap::new(7, pupil, None).unwrap();
        let command = Command::device([(SegmentId(2), Ptt::new(1.0, -0.25, 0.1))]);
        let text = serialize(&command, &map, &flat(), header()).render();

        let expected = "[Param]\n\
            MirrorSerial = PWA37-05-04-0404\n\
            DriverSerial = 09160017\n\
            nbSegment = 2\n\
            \n\
            [Segment1]\n\
            Enable = 1\n\
            Piston = 0\n\
            Tip = 0\n\
            Tilt = 0\n\
            \n\
            [Segment2]\n\
            Enable = 1\n\
            Piston = 1\n\
            Tip = -0.25\n\
            Tilt = 0.1\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_round_trip_is_identity_on_resolved_command() {
        let map = map();
        let flat = Command::device([(SegmentId(2), Ptt::new(0.013, 0.0, -0.002))]);
        let units = PttUnits {
            piston: PistonUnit::Nanometers,
            tilt: TiltUnit::Microradians,
        };
        let command = Command::new(
            units,
            [
                (SegmentId(3), Ptt::new(1000.0, 0.0, 0.0)),
                (SegmentId(9), Ptt::new(-333.3, 1.0 / 3.0, 2e-7)),
            ],
        );

        let text = serialize(&command, &map, &flat, header()).render();
        let parsed = DeviceNativeFormat::new(map.clone()).parse(&text).unwrap();
        assert_eq!(parsed, command.resolved(&map, &flat));
    }

    #[test]
    fn test_disabled_segments_written_but_not_parsed() {
        let map = map().with_disabled([SegmentId(11)]).unwrap();
        let command = Command::device([(SegmentId(3), Ptt::new(1.0, 0.0, 0.0))]);
        let set = serialize(&command, &map, &flat(), header());

        let disabled = set
            .records
            .iter()
            .find(|r| r.channel == DriverChannel(11))
            .unwrap();
        assert!(!disabled.enabled);
        assert_eq!(set.render().matches("Enable = 0").count(), 1);

        let parsed = DeviceNativeFormat::new(map.clone())
            .parse(&set.render())
            .unwrap();
        assert!(!parsed.contains(SegmentId(11)));
        assert_eq!(parsed, command.resolved(&map, &flat()));
    }

    #[test]
    fn test_custom_driver_channels() {
        let pupil = vec![SegmentId(1), SegmentId(2), SegmentId(3)];
        let channels = vec![DriverChannel(7), DriverChannel(5), DriverChannel(6)];
        let map = SegmentMap::new(7, pupil, Some(channels)).unwrap();
        let command = Command::device([(SegmentId(2), Ptt::new(0.2, 0.0, 0.0))]);

        let text = serialize(&command, &map, &flat(), header()).render();
        assert!(text.contains("[Segment5]\nEnable = 1\nPiston = 0.2"));

        let parsed = DeviceNativeFormat::new(map).parse(&text).unwrap();
        assert_eq!(parsed.get(SegmentId(2)), Some(Ptt::new(0.2, 0.0, 0.0)));
    }

    #[test]
    fn test_parse_tolerates_comments_and_spacing() {
        let text = "; written by hand\n[Param]\nMirrorSerial=M1\nDriverSerial = D1\nnbSegment = 1\n\n# center\n[Segment1]\nEnable=1\nPiston = 0.5\nTip=0\nTilt = -0\n";
        let set = NativeRecordSet::parse_str(text).unwrap();
        assert_eq!(set.header.mirror_serial, "M1");
        assert_eq!(set.records.len(), 1);
        assert_eq!(set.records[0].ptt, Ptt::new(0.5, 0.0, 0.0));
    }

    #[test]
    fn test_parse_rejects_count_mismatch() {
        let text = "[Param]\nMirrorSerial = M\nDriverSerial = D\nnbSegment = 2\n[Segment1]\nEnable = 1\nPiston = 0\nTip = 0\nTilt = 0\n";
        assert!(matches!(
            NativeRecordSet::parse_str(text).unwrap_err(),
            ParseError::SegmentCount {
                declared: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn test_parse_rejects_duplicate_channel() {
        let record = "[Segment1]\nEnable = 1\nPiston = 0\nTip = 0\nTilt = 0\n";
        let text = format!("[Param]\nMirrorSerial = M\nDriverSerial = D\nnbSegment = 2\n{record}{record}");
        assert!(matches!(
            NativeRecordSet::parse_str(&text).unwrap_err(),
            ParseError::DuplicateChannel(DriverChannel(1))
        ));
    }

    #[test]
    fn test_parse_rejects_missing_and_unknown_keys() {
        let missing = "[Param]\nMirrorSerial = M\nDriverSerial = D\nnbSegment = 1\n[Segment1]\nEnable = 1\nPiston = 0\nTip = 0\n";
        assert!(matches!(
            NativeRecordSet::parse_str(missing).unwrap_err(),
            ParseError::Malformed { line: 5, .. }
        ));

        let unknown = "[Param]\nMirrorSerial = M\nDriverSerial = D\nnbSegment = 0\nGain = 2\n";
        assert!(matches!(
            NativeRecordSet::parse_str(unknown).unwrap_err(),
            ParseError::Malformed { line: 5, .. }
        ));

        let no_header = "[Segment1]\nEnable = 1\nPiston = 0\nTip = 0\nTilt = 0\n";
        assert!(NativeRecordSet::parse_str(no_header).is_err());
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let text = "[Param]\nMirrorSerial = M\nDriverSerial = D\nnbSegment = 1\n[Segment30]\nEnable = 1\nPiston = 0\nTip = 0\nTilt = 0\n";
        let err = DeviceNativeFormat::new(map()).parse(text).unwrap_err();
        assert!(matches!(
            err,
            ParseError::Map(MapError::UnknownChannel(DriverChannel(30)))
        ));
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("command.ini");
        let command = Command::device([(SegmentId(4), Ptt::new(-1.5, 0.75, 0.0))]);
        let set = serialize(&command, &map(), &flat(), header());

        set.write_to(&path).unwrap();
        assert_eq!(NativeRecordSet::read_from(&path).unwrap(), set);
        let loaded = DeviceNativeFormat::new(map()).load_file(&path).unwrap();
        assert_eq!(loaded.get(SegmentId(4)), Some(Ptt::new(-1.5, 0.75, 0.0)));
    }
}
