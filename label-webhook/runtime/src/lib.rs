#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod admission;
mod args;
pub mod metrics;
pub mod patch;
pub mod policy;
pub mod review;

pub use self::{
    admission::Admission,
    args::Args,
    metrics::AdmissionMetrics,
    policy::{Decision, LabelPolicy},
};
