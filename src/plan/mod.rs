//! 计划层：监督者的任务分解簿记

pub mod tracker;

pub use tracker::{ItemStatus, Plan, PlanItem, PlanTracker};
