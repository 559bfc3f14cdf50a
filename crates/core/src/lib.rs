//! # EMR Core
//!
//! Core business logic for the clinical records backend.
//!
//! This crate contains pure data operations over the relational store:
//! - Patients, vitals, intake histories and appointments
//! - The consultation workflow engine ([`repositories::consultations`])
//! - Prerequisite checks, partial updates and the activity audit
//!
//! **No API concerns**: Authentication, HTTP servers, or service interfaces belong in
//! `api-rest` or `api-shared`.

pub mod accounts;
pub mod audit;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod exam;
pub mod prerequisites;
pub mod repositories;
pub mod update;
pub mod validation;

#[cfg(test)]
mod test_support;

pub use accounts::{Account, AccountService, Role};
pub use audit::{spawn_writer, AuditLog, AuditReceiver};
pub use config::CoreConfig;
pub use db::Store;
pub use emr_types::{NationalId, NonEmptyText, TextError};
pub use error::{EmrError, EmrResult, Prerequisite};
pub use exam::{ExamKind, PhysicalExam};
pub use repositories::consultations::{
    ConsultationService, ConsultationStatus, Initialised, Requirement, Uninitialised,
};
