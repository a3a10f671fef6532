//! Dripline — conversational onboarding funnel with a durable drip scheduler.

pub mod campaign;
pub mod catalog;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod richmenu;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod webhook;
