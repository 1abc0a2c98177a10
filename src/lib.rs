//! Continuous acquisition of `AirPods` runtime state.
//!
//! Two asynchronous sources feed one coordinator:
//!
//! - **BLE**: Apple Continuity proximity-pairing advertisements carry
//!   per-pod battery (10% steps), charging, in-ear and case state without
//!   any connection. When a device's encryption key is known, the encrypted
//!   advertisement suffix upgrades battery readings to 1% precision and
//!   doubles as the way to recognize a device behind its privacy-randomized
//!   advertisement address.
//! - **AAP**: an Apple Accessory Protocol session over L2CAP PSM 0x1001
//!   streams exact battery notifications and can return the
//!   proximity-pairing keys used above.
//!
//! The [`Coordinator`] runs both branches, prefers AAP for the device it is
//! bound to, and fans consistent whole-table snapshots out to subscribers.
//!
//! ```no_run
//! # async fn run() -> podlink::Result<()> {
//! let coordinator = podlink::Coordinator::new(podlink::Config::default());
//! let mut updates = coordinator.subscribe();
//! let _scan = coordinator.start_ble_loop().await?;
//!
//! while let Some(snapshot) = updates.recv().await {
//!    for state in snapshot.values() {
//!       println!("{}: {:?}", state.real_mac, state.lowest_battery());
//!    }
//! }
//! # Ok(())
//! # }
//! ```

pub mod aap;
pub mod bluetooth;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod proximity;
pub mod state;

pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{PodLinkError, Result};
pub use event::{Snapshot, Subscription};
pub use state::{PodSide, PodState, Source};
