use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Events emitted at the interesting transitions of the trust pipeline.
/// Consumed in-process by `process_events`; tokens and codes are never
/// carried on the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    RiskAssessed {
        assessment_id: Uuid,
        decision: String,
        score: i32,
    },
    ChallengeIssued {
        user_id: Uuid,
    },
    ChallengeMerged {
        user_id: Uuid,
    },
    ChallengeVerified {
        user_id: Uuid,
    },
    ChallengesExpired {
        count: u64,
    },
    PaymentIntentCreated {
        intent_id: String,
        order_id: Option<Uuid>,
    },
    TransactionTransitioned {
        intent_id: String,
        from: String,
        to: String,
    },
    CheckoutBlocked {
        score: i32,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Best-effort send; a saturated or closed channel never blocks the
    /// request path.
    pub fn send(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("dropping pipeline event: {}", e);
        }
    }
}

/// Drains the event channel and logs each event as one structured record.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        match &event {
            Event::RiskAssessed {
                assessment_id,
                decision,
                score,
            } => {
                info!(%assessment_id, %decision, score, "risk assessment recorded");
            }
            Event::ChallengeIssued { user_id } => {
                info!(%user_id, "verification challenge issued");
            }
            Event::ChallengeMerged { user_id } => {
                info!(%user_id, "verification challenge merged into existing");
            }
            Event::ChallengeVerified { user_id } => {
                info!(%user_id, "verification challenge verified");
            }
            Event::ChallengesExpired { count } => {
                info!(count, "stale verification challenges expired");
            }
            Event::PaymentIntentCreated {
                intent_id,
                order_id,
            } => {
                info!(%intent_id, ?order_id, "payment intent created");
            }
            Event::TransactionTransitioned { intent_id, from, to } => {
                info!(%intent_id, %from, %to, "payment transaction transitioned");
            }
            Event::CheckoutBlocked { score } => {
                info!(score, "checkout blocked by risk decision");
            }
        }
    }
    info!("event channel closed, processor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_is_non_blocking_when_channel_is_full() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = EventSender::new(tx);
        sender.send(Event::CheckoutBlocked { score: 80 });
        // Second send overflows the buffer; it must drop, not block.
        sender.send(Event::CheckoutBlocked { score: 90 });
    }
}
