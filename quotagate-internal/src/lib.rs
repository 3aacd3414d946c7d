pub mod config; // gateway config file
pub mod endpoints; // API endpoints
pub mod entitlement; // entitlement records, storage, and the quota gate
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod observability; // utilities for observability (logs, metrics, etc.)
pub mod payment; // payment provider client and webhook verification
pub mod rate_limit; // rate limiting
pub mod reconcile; // checkout and webhook reconciliation
pub mod testing; // helpers for constructing gateway state in tests
