pub mod checkout;
pub mod entitlement;
pub mod fallback;
pub mod scan;
pub mod status;
pub mod webhook;
