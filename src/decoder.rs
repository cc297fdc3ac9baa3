//! Result decoding.
//!
//! Turns completed server results into events: one `row` per tuple, one
//! structured `error` per failed command, nothing for commands without rows.

use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::event::{ErrorEvent, Event, EventSink};
use crate::pg::session::{ExecStatus, ServerResult, Session};
use crate::pg::Oid;

/// One column value of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    /// Text-format value; `None` is SQL NULL.
    pub raw_value: Option<String>,
    pub type_oid: Oid,
}

/// A row in server column order.
///
/// Inline storage covers the common column counts without a heap allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ResultRow {
    fields: SmallVec<[Field; 8]>,
}

impl ResultRow {
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// First field named `name`.
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn into_fields(self) -> SmallVec<[Field; 8]> {
        self.fields
    }
}

impl FromIterator<Field> for ResultRow {
    fn from_iter<I: IntoIterator<Item = Field>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Counters for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub results: usize,
    pub rows: usize,
    pub errors: usize,
}

/// Take every completed result from `session` and emit its events.
pub(crate) fn drain_results<S: Session>(session: &mut S, sink: &EventSink) -> DrainSummary {
    let mut summary = DrainSummary::default();
    while let Some(result) = session.next_result() {
        summary.results += 1;
        decode_result(result, sink, &mut summary);
    }
    summary
}

fn decode_result(result: ServerResult, sink: &EventSink, summary: &mut DrainSummary) {
    match result.status {
        ExecStatus::TuplesOk => {
            debug!(
                rows = result.ntuples(),
                columns = result.nfields(),
                tag = ?result.command_tag,
                "tuples result"
            );
            let ServerResult { columns, rows, .. } = result;
            for values in rows {
                let row: ResultRow = columns
                    .iter()
                    .zip(values)
                    .map(|(column, raw_value)| Field {
                        name: column.name.clone(),
                        raw_value,
                        type_oid: column.type_oid,
                    })
                    .collect();
                summary.rows += 1;
                sink.emit(Event::Row(row));
            }
        }
        ExecStatus::FatalError => {
            let info = result.error_info();
            debug!(code = ?info.code, message = ?info.message, "error result");
            summary.errors += 1;
            sink.emit(Event::Error(ErrorEvent::Server(info)));
        }
        ExecStatus::CommandOk | ExecStatus::EmptyQuery => {
            debug!(status = ?result.status, tag = ?result.command_tag, "command result");
        }
        other => {
            warn!(status = ?other, "unrecognized result status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::session::Column;

    fn tuples(columns: &[(&str, u32)], rows: Vec<Vec<Option<&str>>>) -> ServerResult {
        let mut result = ServerResult::new(ExecStatus::TuplesOk);
        result.columns = columns
            .iter()
            .map(|(name, oid)| Column {
                name: name.to_string(),
                type_oid: Oid(*oid),
            })
            .collect();
        result.rows = rows
            .into_iter()
            .map(|r| r.into_iter().map(|v| v.map(str::to_string)).collect())
            .collect();
        result
    }

    #[test]
    fn test_rows_are_emitted_one_per_tuple_in_column_order() {
        let (sink, mut stream) = EventSink::channel();
        let mut summary = DrainSummary::default();
        let result = tuples(
            &[("id", 23), ("name", 25)],
            vec![vec![Some("1"), Some("a")], vec![Some("2"), None]],
        );

        decode_result(result, &sink, &mut summary);
        assert_eq!(summary.rows, 2);

        let Event::Row(first) = stream.try_recv().unwrap() else {
            panic!("expected a row")
        };
        let names: Vec<_> = first.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["id", "name"]);
        assert_eq!(first.fields()[0].raw_value.as_deref(), Some("1"));
        assert_eq!(first.fields()[0].type_oid, Oid::INT4);

        let Event::Row(second) = stream.try_recv().unwrap() else {
            panic!("expected a row")
        };
        assert_eq!(second.get("name").unwrap().raw_value, None);
        assert!(stream.try_recv().is_err());
    }

    #[test]
    fn test_command_results_emit_nothing() {
        let (sink, mut stream) = EventSink::channel();
        let mut summary = DrainSummary::default();
        decode_result(ServerResult::new(ExecStatus::CommandOk), &sink, &mut summary);
        decode_result(ServerResult::new(ExecStatus::EmptyQuery), &sink, &mut summary);
        decode_result(ServerResult::new(ExecStatus::CopyOut), &sink, &mut summary);
        assert!(stream.try_recv().is_err());
        assert_eq!(summary, DrainSummary::default());
    }

    #[test]
    fn test_row_serializes_as_field_list() {
        let row: ResultRow = [Field {
            name: "?column?".into(),
            raw_value: Some("1".into()),
            type_oid: Oid::INT4,
        }]
        .into_iter()
        .collect();
        assert_eq!(
            serde_json::to_value(&row).unwrap(),
            serde_json::json!([{"name": "?column?", "rawValue": "1", "typeOid": 23}])
        );
    }
}
