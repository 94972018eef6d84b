//! Wire protocols

pub mod sap;
pub mod sip;
