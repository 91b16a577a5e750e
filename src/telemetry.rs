use metrics::counter;
use sqlx::Error as SqlxError;

pub(crate) fn record_internal_error_metrics(err: &anyhow::Error) {
    counter!("fwfleet_internal_errors_total").increment(1);
    if let Some(db_err) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())
    {
        let kind = match db_err {
            SqlxError::RowNotFound => "row_not_found",
            SqlxError::Database(_) => "database",
            SqlxError::Io(_) => "io",
            _ => "other",
        };
        counter!("fwfleet_db_errors_total", "kind" => kind).increment(1);
    }
}

pub(crate) fn record_router_outcome(job_kind: &'static str, outcome: &'static str) {
    counter!("fwfleet_router_outcomes_total", "job" => job_kind, "outcome" => outcome)
        .increment(1);
}
