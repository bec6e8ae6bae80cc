//! BLE ingestion: parser registry, Victron codec, and the scan loop
//!
//! An advertisement's manufacturer-data field carries a little-endian
//! manufacturer identifier in its first two bytes; the registry maps that
//! identifier to a parser which turns the payload into a typed
//! [`SensorRecord`](crate::types::SensorRecord).

pub mod configurable;
pub mod scan;
pub mod victron;

pub use configurable::{ConfigurableParser, FieldSpec, LayoutSpec};
pub use scan::{Advertisement, AdvertisementSource, ScanError, ScanLoop, StdinAdvertisementSource};
pub use victron::VictronParser;

use std::sync::Arc;

use thiserror::Error;

use crate::types::SensorRecord;

/// Parsing failures that indicate a malformed frame (soft conditions -
/// missing key, integrity mismatch, unknown record type - yield
/// `Ok(None)` instead: the advertisement is recorded raw, nothing more).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame too short: need {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },

    #[error("frame is not for this parser")]
    WrongManufacturer,
}

/// Per-parse options supplied by the scan loop.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Per-device AES key for encrypted advertisement payloads.
    pub encryption_key: Option<Vec<u8>>,
}

/// A manufacturer-data parser.
pub trait SensorParser: Send + Sync {
    /// The Bluetooth SIG manufacturer identifier this parser handles.
    fn manufacturer_id(&self) -> u16;

    /// Cheap structural check beyond the manufacturer id.
    fn matches(&self, data: &[u8]) -> bool;

    fn parse(
        &self,
        data: &[u8],
        opts: &ParseOptions,
    ) -> Result<Option<SensorRecord>, ParseError>;
}

/// Extract the little-endian manufacturer identifier.
pub fn manufacturer_id(data: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = data.get(0..2)?.try_into().ok()?;
    Some(u16::from_le_bytes(bytes))
}

/// Maps manufacturer identifiers to registered parsers.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: Vec<Arc<dyn SensorParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in parsers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(VictronParser::new()));
        registry
    }

    pub fn register(&mut self, parser: Arc<dyn SensorParser>) {
        tracing::debug!(
            manufacturer = format!("0x{:04x}", parser.manufacturer_id()),
            "Sensor parser registered"
        );
        self.parsers.push(parser);
    }

    /// The parser registered for this advertisement's manufacturer, or
    /// `None` when nobody claims it.
    pub fn find_parser_for(&self, data: &[u8]) -> Option<Arc<dyn SensorParser>> {
        let id = manufacturer_id(data)?;
        self.parsers
            .iter()
            .find(|p| p.manufacturer_id() == id && p.matches(data))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manufacturer_id_little_endian() {
        assert_eq!(manufacturer_id(&[0xe1, 0x02, 0xff]), Some(0x02e1));
        assert_eq!(manufacturer_id(&[0xe1]), None);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ParserRegistry::with_defaults();
        let victron_frame = [0xe1, 0x02, 0xa1, 0x02, 0x02, 0x00, 0x00, 0x00, 0x00];
        assert!(registry.find_parser_for(&victron_frame).is_some());

        let unknown_frame = [0x4c, 0x00, 0x01];
        assert!(registry.find_parser_for(&unknown_frame).is_none());
    }
}
