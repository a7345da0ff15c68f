use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::record::ExchangeRecord;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExchangeEventKind {
    Request,
    Send,
    Response,
    End,
    Abort,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExchangeEvent {
    pub event_id: Uuid,
    pub exchange_id: Uuid,
    pub kind: ExchangeEventKind,
    pub record: ExchangeRecord,
}

pub type TelemetryEvents = ReceiverStream<ExchangeEvent>;

pub fn telemetry_channel() -> (mpsc::Sender<ExchangeEvent>, TelemetryEvents) {
    let (sender, receiver) = mpsc::channel(50_000);
    (sender, ReceiverStream::new(receiver))
}
