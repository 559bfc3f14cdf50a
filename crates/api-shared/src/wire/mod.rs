//! Request and response bodies of the HTTP surface.
//!
//! Field names follow the clinic's Spanish JSON vocabulary (`idFichaClinica`, `relato`, ...);
//! Rust field names stay English.

mod consultation;

pub use consultation::{
    BulkDiagnosesReq, CancelConsultationReq, DiagnosisReq, NarrativeReq, PhysicalExamReq,
    PrescriptionLineReq, PrescriptionReq, StartConsultationReq, StartConsultationRes,
    WorkPlanReq,
};
