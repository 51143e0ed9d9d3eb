//! Instruction interpretation tiers. Tier 0 is the portable
//! decode-and-execute interpreter; it is the only tier.

pub mod tier0;
