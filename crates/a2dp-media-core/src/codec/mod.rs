//! Codec layer: SBC, its A2DP capability element, parameter negotiation
//! and input format conversion

pub mod info;
pub mod negotiator;
pub mod resample;
pub mod sbc;
