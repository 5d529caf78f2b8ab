pub mod order;
pub mod payment_transaction;
pub mod risk_assessment;
pub mod risk_assessment_store;
pub mod verification_challenge;

pub use order::Entity as Order;
pub use payment_transaction::Entity as PaymentTransaction;
pub use risk_assessment::Entity as RiskAssessment;
pub use risk_assessment_store::Entity as RiskAssessmentStore;
pub use verification_challenge::Entity as VerificationChallenge;
