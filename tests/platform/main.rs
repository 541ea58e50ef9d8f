//! Platform-level integration: the assembled stack from wire frames
//! down to storage, tenancy behaviour, and replication over TCP.

mod replication;
mod scenarios;
mod tenancy;
