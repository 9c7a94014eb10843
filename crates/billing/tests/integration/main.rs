//! Integration tests for the subscription lifecycle
//!
//! These run against a real Postgres with migrations applied and use a mock
//! payment gateway, so no network credentials are needed.
//!
//! ```bash
//! export DATABASE_URL="postgres://localhost/vitrine_test"
//! cargo test --test integration -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod mock_gateway;
mod subscription_flow;
mod webhook_delivery;
