//! Backend selection and connection steering for the virtual service.

pub mod balancer;
pub mod selector;
