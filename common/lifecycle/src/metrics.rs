pub(crate) const METRIC_FATAL_SIGNAL: &str = "lifecycle_fatal_signal_total";
pub(crate) const METRIC_SHUTDOWN_INITIATED: &str = "lifecycle_shutdown_initiated_total";
pub(crate) const METRIC_SHUTDOWN_COMPLETED: &str = "lifecycle_shutdown_completed_total";
pub(crate) const METRIC_TASK_SHUTDOWN_DURATION: &str = "lifecycle_task_shutdown_duration_seconds";
pub(crate) const METRIC_TASK_SHUTDOWN_RESULT: &str = "lifecycle_task_shutdown_result_total";

pub(crate) fn emit_fatal_signal(kind: &str, accepted: bool) {
    metrics::counter!(
        METRIC_FATAL_SIGNAL,
        "kind" => kind.to_string(),
        "accepted" => accepted.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_initiated(service_name: &str, trigger_kind: &str) {
    metrics::counter!(
        METRIC_SHUTDOWN_INITIATED,
        "service_name" => service_name.to_string(),
        "trigger" => trigger_kind.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_completed(service_name: &str, clean: bool) {
    metrics::counter!(
        METRIC_SHUTDOWN_COMPLETED,
        "service_name" => service_name.to_string(),
        "clean" => clean.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_task_shutdown_duration(
    service_name: &str,
    task: &str,
    result: &str,
    duration_secs: f64,
) {
    metrics::histogram!(
        METRIC_TASK_SHUTDOWN_DURATION,
        "service_name" => service_name.to_string(),
        "task" => task.to_string(),
        "result" => result.to_string()
    )
    .record(duration_secs);
}

pub(crate) fn emit_task_shutdown_result(service_name: &str, task: &str, result: &str) {
    metrics::counter!(
        METRIC_TASK_SHUTDOWN_RESULT,
        "service_name" => service_name.to_string(),
        "task" => task.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}
