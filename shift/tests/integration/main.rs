#![cfg(feature = "test-utils")]

mod cancel_test;
mod cutover_test;
mod metrics_test;
mod migration_test;
mod recovery_test;
mod throttle_test;
