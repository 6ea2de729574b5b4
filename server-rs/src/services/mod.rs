pub mod addons;
pub mod flutterwave;
pub mod limits;
pub mod reconciler;
pub mod stripe_service;
pub mod usage_meters;
pub mod wallet;
