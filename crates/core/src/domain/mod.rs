pub mod analysis;
pub mod automation;
pub mod cache;
pub mod knowledge;
pub mod message;
pub mod provider;
pub mod tenant;
pub mod wallet;
