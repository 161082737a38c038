//! Unit tests for the worker pool, organized by domain.

use super::test_helpers::*;
use crate::types::{AddOptions, DownloadId, Status};
