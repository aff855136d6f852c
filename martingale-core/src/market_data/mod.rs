//! Synthetic market data: assets, prices and time

pub mod asset;
pub mod clock;
pub mod listing;
pub mod noise;
pub mod price_generator;
pub mod registry;

pub use asset::{Asset, AssetListing, AssetSnapshot, AssetStatus, PricePoint};
pub use clock::{Clock, ManualClock, SystemClock};
pub use listing::AssetLister;
pub use noise::{GaussianNoise, NoiseSource, ScriptedNoise};
pub use price_generator::{next_price, PriceGenerator};
pub use registry::{AssetHandle, AssetRegistry};
