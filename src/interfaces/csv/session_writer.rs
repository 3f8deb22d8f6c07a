use crate::domain::draw::DrawRecord;
use crate::domain::session::Session;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

/// Final state of one session, flattened for CSV output. The `session`
/// column echoes the label the input file used, so replay output is
/// deterministic even though codes and ids are generated.
#[derive(Debug, Serialize)]
pub struct SessionRow {
    pub session: String,
    pub status: String,
    pub participants: u32,
    pub capacity: u32,
    pub winner: Option<u64>,
    pub winning_position: Option<u32>,
    pub timestamp_sum: Option<String>,
}

impl SessionRow {
    pub fn from_state(label: &str, session: &Session, record: Option<&DrawRecord>) -> Self {
        Self {
            session: label.to_string(),
            status: session.status.to_string(),
            participants: session.participant_count,
            capacity: session.capacity,
            winner: record.map(|r| r.winner_user_id),
            winning_position: record.map(|r| r.winning_position),
            timestamp_sum: record.map(|r| r.timestamp_sum.to_string()),
        }
    }
}

/// Writes session rows as CSV to any `Write` destination.
pub struct SessionWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> SessionWriter<W> {
    pub fn new(dest: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(dest),
        }
    }

    /// Serializes all rows and flushes the destination.
    pub fn write_sessions(&mut self, rows: impl IntoIterator<Item = SessionRow>) -> Result<()> {
        for row in rows {
            self.writer.serialize(row)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Amount;
    use crate::domain::product::Product;
    use crate::domain::session::SessionCode;
    use rust_decimal_macros::dec;

    fn session() -> Session {
        let product = Product {
            id: 1,
            price_per_person: Amount::new(dec!(10.0)).unwrap(),
            group_size: 3,
            timeout_millis: 60_000,
            active: true,
            stock: 5,
            sold: 0,
        };
        Session::new(&product, SessionCode::new("AAAAAA"), 0)
    }

    #[test]
    fn test_writer_active_session() {
        let mut buf = Vec::new();
        let mut writer = SessionWriter::new(&mut buf);
        writer
            .write_sessions([SessionRow::from_state("g1", &session(), None)])
            .unwrap();
        drop(writer);

        let output = String::from_utf8(buf).unwrap();
        assert!(output.starts_with(
            "session,status,participants,capacity,winner,winning_position,timestamp_sum"
        ));
        assert!(output.contains("g1,ACTIVE,0,3,,,"));
    }

    #[test]
    fn test_writer_drawn_session() {
        let mut session = session();
        session.participant_count = 3;
        session.status = crate::domain::session::SessionStatus::Success;
        let record = DrawRecord {
            id: uuid::Uuid::new_v4(),
            session_id: session.id,
            timestamp_sum: 6_000,
            winning_position: 0,
            winner_user_id: 42,
            pickup_code: None,
            entries: Vec::new(),
            created_at: 3_000,
            claim_expires_at: 3_000 + crate::domain::draw::CLAIM_WINDOW_MILLIS,
        };

        let mut buf = Vec::new();
        let mut writer = SessionWriter::new(&mut buf);
        writer
            .write_sessions([SessionRow::from_state("g1", &session, Some(&record))])
            .unwrap();
        drop(writer);

        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("g1,SUCCESS,3,3,42,0,6000"));
    }
}
