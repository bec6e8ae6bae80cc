//! Default document schema
//!
//! The document is constructed once at process start from this template.
//! Typed placeholders (`null` leaves, empty containers) keep `replace`
//! setters valid from the first mutation - a path the schema names always
//! exists.

use serde_json::{json, Value};

/// Build the boot document.
pub fn default_document() -> Value {
    json!({
        "navigation": {
            "position": null,
            "speed": null,
            "course": null
        },
        "anchor": {
            "anchorDeployed": false,
            "anchorLocation": null,
            "anchorDropLocation": null,
            "rode": null,
            "criticalRange": { "r": null, "units": "m" },
            "warningRange": { "r": null, "units": "m" }
        },
        "aisTargets": {},
        "alerts": {
            "active": [],
            "resolved": []
        },
        "bluetooth": {
            "devices": {},
            "selectedDevices": {},
            "status": {
                "scanning": false,
                "state": "idle"
            },
            "lastUpdated": null
        },
        "tides": {},
        "forecast": {},
        "units": {
            "distance": "meters"
        }
    })
}
