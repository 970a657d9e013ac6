//! Behavioural scenarios for `prevue up` with a relay.

mod tunnel;
