//! Behavioural scenarios for provisioning, purging and teardown.

mod lifecycle;
