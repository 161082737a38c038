//! Connection-count and chunk-size heuristics.

use crate::config::{ALIGN_SIZE, RuntimeOptions};
use crate::types::Task;

/// Starting number of connections for a file size.
///
/// The square-root heuristic favors few connections for small files to avoid
/// connection overhead, clamped so no chunk goes below `min_chunk_size` and
/// never above `max_connections_per_host`. An explicit
/// `connection_count_override` wins but is clamped by the same bounds.
pub(crate) fn initial_connections(file_size: u64, runtime: &RuntimeOptions) -> usize {
    if file_size == 0 {
        return 1;
    }

    let max_conns = runtime.max_connections_per_host.max(1);
    let min_chunk = runtime.min_chunk_size;

    // Convert to float first to avoid integer truncation on small files
    let size_mib = file_size as f64 / (1024.0 * 1024.0);
    let mut workers = match runtime.connection_count_override {
        Some(n) => n.max(1),
        None => size_mib.sqrt().round() as usize,
    };

    // Hard constraint: no chunks smaller than min_chunk_size.
    // A 20 MiB file with a 10 MiB minimum strictly caps out at 2 workers.
    if min_chunk > 0 {
        let max_possible_chunks = (file_size / min_chunk).max(1) as usize;
        workers = workers.min(max_possible_chunks);
    }

    workers.clamp(1, max_conns)
}

/// Chunk size for the initial task partition.
///
/// Parallel mode shares the file evenly across connections, clamped below by
/// `min_chunk_size` and aligned down to 4 KiB. Sequential mode fixes the
/// chunk at `min_chunk_size` so ranges complete in order.
pub(crate) fn chunk_size(file_size: u64, num_conns: usize, runtime: &RuntimeOptions) -> u64 {
    let size = if runtime.sequential_download || num_conns == 0 {
        runtime.min_chunk_size
    } else {
        (file_size / num_conns as u64).max(runtime.min_chunk_size)
    };

    let aligned = (size / ALIGN_SIZE) * ALIGN_SIZE;
    aligned.max(ALIGN_SIZE)
}

/// Generate the initial task partition of `[0, file_size)`.
pub(crate) fn create_tasks(file_size: u64, chunk: u64) -> Vec<Task> {
    if chunk == 0 || file_size == 0 {
        return Vec::new();
    }

    let count = file_size.div_ceil(chunk) as usize;
    let mut tasks = Vec::with_capacity(count);

    let mut offset = 0u64;
    while offset < file_size {
        let length = chunk.min(file_size - offset);
        tasks.push(Task::new(offset, length));
        offset += length;
    }
    tasks
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn ten_mib_file_gets_three_workers() {
        // round(sqrt(10)) = 3, within [1, 16]
        let runtime = RuntimeOptions::default();
        assert_eq!(initial_connections(10 * MIB, &runtime), 3);
    }

    #[test]
    fn min_chunk_caps_the_worker_count() {
        let mut runtime = RuntimeOptions::default();
        runtime.min_chunk_size = 10 * MIB;
        assert_eq!(
            initial_connections(20 * MIB, &runtime),
            2,
            "a 20 MiB file with a 10 MiB minimum chunk allows at most 2 workers"
        );
    }

    #[test]
    fn worker_count_never_exceeds_max_connections() {
        let mut runtime = RuntimeOptions::default();
        runtime.max_connections_per_host = 4;
        // sqrt(1024) = 32, clamped to 4
        assert_eq!(initial_connections(1024 * MIB, &runtime), 4);
    }

    #[test]
    fn small_and_empty_files_get_one_worker() {
        let runtime = RuntimeOptions::default();
        assert_eq!(initial_connections(0, &runtime), 1);
        assert_eq!(initial_connections(100 * 1024, &runtime), 1);
    }

    #[test]
    fn override_wins_but_stays_clamped() {
        let mut runtime = RuntimeOptions::default();
        runtime.connection_count_override = Some(8);
        assert_eq!(initial_connections(1024 * MIB, &runtime), 8);

        // Still bounded by max_connections_per_host
        runtime.connection_count_override = Some(64);
        assert_eq!(initial_connections(1024 * MIB, &runtime), 16);

        // And by the min-chunk constraint
        runtime.connection_count_override = Some(64);
        runtime.min_chunk_size = 10 * MIB;
        assert_eq!(initial_connections(20 * MIB, &runtime), 2);
    }

    #[test]
    fn chunk_size_is_aligned_down_to_4kib() {
        let runtime = RuntimeOptions::default();
        let size = chunk_size(10 * MIB + 1234, 3, &runtime);
        assert_eq!(size % ALIGN_SIZE, 0, "chunk size must be 4 KiB aligned");
        assert!(size >= runtime.min_chunk_size);
    }

    #[test]
    fn sequential_mode_fixes_chunk_at_min_size() {
        let mut runtime = RuntimeOptions::default();
        runtime.sequential_download = true;
        assert_eq!(chunk_size(1024 * MIB, 16, &runtime), runtime.min_chunk_size);
    }

    #[test]
    fn tasks_partition_the_file_without_gaps_or_overlap() {
        let file_size = 10 * MIB + 4096 + 17;
        let tasks = create_tasks(file_size, 3 * MIB);

        let mut expected_offset = 0;
        for task in &tasks {
            assert_eq!(
                task.offset, expected_offset,
                "each task must start where the previous one ended"
            );
            assert!(task.length > 0, "zero-length tasks are invalid");
            expected_offset = task.end();
        }
        assert_eq!(
            expected_offset, file_size,
            "the final task must end exactly at the file size"
        );
    }

    #[test]
    fn last_task_carries_the_remainder() {
        let tasks = create_tasks(10, 4);
        assert_eq!(
            tasks,
            vec![Task::new(0, 4), Task::new(4, 4), Task::new(8, 2)]
        );
    }

    #[test]
    fn empty_file_produces_no_tasks() {
        assert!(create_tasks(0, 4096).is_empty());
    }
}
