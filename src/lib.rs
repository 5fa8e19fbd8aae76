//! Outpost replicates Kubernetes resource state from a central cluster to
//! intermittently connected edge agents.
//!
//! The server watches every resource kind the cluster serves, appends each
//! change to a durable replication log, and fans it out to the queue of
//! every agent entitled to it. Agents poll for a bounded manifest page,
//! stream the matching items over server-sent events, and replay them in
//! id order against a local mirror, resuming from their durable cursor
//! after any amount of downtime.

pub mod agent;
pub mod cli;
pub mod config;
pub mod event;
pub mod kubernetes;
pub mod nodeset;
pub mod server;
