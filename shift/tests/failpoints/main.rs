#![cfg(all(feature = "failpoints", feature = "test-utils"))]

mod migration_test;
