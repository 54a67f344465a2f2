#![allow(dead_code)]

use std::sync::Once;

use reheat::{Document, DocumentOptions, LoadOptions};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static INIT: Once = Once::new();

/// Install a log subscriber when `REHEAT_LOG` holds a filter (e.g. `reheat=trace`).
pub fn setup() {
    INIT.call_once(|| {
        let Some(filter) = std::env::var("REHEAT_LOG")
            .ok()
            .and_then(|s| s.parse::<Targets>().ok())
        else {
            return;
        };
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true)
                    .compact(),
            )
            .with(filter)
            .try_init()
            .ok();
    });
}

/// A document with deterministic salts.
pub fn document() -> Document {
    Document::new(DocumentOptions::new().seed(0x5eed))
}

/// Load and save with default options.
pub fn round_trip(html: &[u8]) -> String {
    let mut doc = document();
    assert!(doc.load(html, &LoadOptions::default()), "load failed");
    doc.save(None).expect("save")
}
