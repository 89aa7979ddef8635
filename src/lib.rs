//! PrintCam Gateway Library
//!
//! Multi-printer monitoring and stream gateway
//!
//! ## Architecture (9 Components)
//!
//! 1. PrinterStore - persisted printer inventory, one JSON document each
//! 2. Discovery - SSDP scan for Bambu printers on the LAN
//! 3. LocalMqttSession - per-printer LAN MQTT telemetry
//! 4. CloudSession - Bambu account plus the shared cloud MQTT session
//! 5. OctoPrintSession - OctoPrint MQTT plugin telemetry
//! 6. StatusAggregator - normalized status cache and transition stream
//! 7. StreamRelayManager - ffmpeg relays and direct MJPEG hand-off
//! 8. NotificationDispatcher - Telegram / WhatsApp pushes on terminal states
//! 9. Supervisor - session lifecycle orchestration
//!
//! ## Design Principles
//!
//! - PrinterStore is the single source of truth for the inventory
//! - One session per printer; cloud printers share one MQTT connection
//! - Sessions never take the process down; they back off and reconnect

pub mod backoff;
pub mod bambu;
pub mod bambu_cloud;
pub mod bambu_local;
pub mod discovery;
pub mod error;
pub mod notifier;
pub mod octoprint;
pub mod printer_store;
pub mod session;
pub mod state;
pub mod status;
pub mod stream_relay;
pub mod supervisor;

pub use error::{Error, Result};
pub use state::{AppConfig, AppState};
