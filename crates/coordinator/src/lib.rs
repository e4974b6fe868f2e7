//! Adaptive polling and delivery coordination for harvest.
//!
//! [`Coordinator`](poller::Coordinator) is the system's entry point: it
//! tracks registered jobs, polls or streams them to completion with an
//! adaptive schedule, and hands each completed result to the persistent
//! store and content applier exactly once via
//! [`DeliveryCoordinator`](delivery::DeliveryCoordinator).

pub mod delivery;
pub mod events;
pub mod poller;
