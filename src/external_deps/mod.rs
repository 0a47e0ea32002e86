//! Integrations that rely on third-party services.
//!
//! This module groups the verification widget capability and the captcha
//! providers that can back it, bridging the relay core with the outside
//! world.

pub mod captcha;

pub use captcha::{CapSolverProvider, CaptchaWidget, DisabledWidget, TurnstileWidget};
