//! Ticket triage: prompt the model, validate what comes back

mod analyzer;
mod judgement;

pub use analyzer::TriageAnalyzer;
pub use judgement::{Judgement, parse_judgement, strip_code_fences};
