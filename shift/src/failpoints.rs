//! Failpoints used by tests to crash migrations at precise points.
//!
//! A failpoint configured with `return` makes the surrounding step fail with
//! [`ErrorKind::FailpointTriggered`]. The optional parameter is carried in the error detail.

use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, ShiftResult};

/// Hit after each bulk copy chunk has been written and its cursor persisted.
pub const COPY_AFTER_CHUNK: &str = "copy.after_chunk";
/// Hit while writes are fenced and the last changes are drained, before the first rename.
pub const CUTOVER_BEFORE_RENAME: &str = "cutover.before_rename";
/// Hit after each rename of a non atomic cutover.
pub const CUTOVER_AFTER_RENAME_STEP: &str = "cutover.after_rename_step";

pub fn shift_fail_point(name: &str) -> ShiftResult<()> {
    fail_point!(name, |parameter| {
        let parameter = parameter.unwrap_or_default();
        bail!(
            ErrorKind::FailpointTriggered,
            "A failpoint was triggered",
            format!("failpoint '{name}' {parameter}")
        );
    });

    Ok(())
}
