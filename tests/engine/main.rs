//! End-to-end tests: clients, adapters and sync cores against a scripted
//! shape server.

mod lifecycle;
mod rpc;
mod scenarios;
mod support;
