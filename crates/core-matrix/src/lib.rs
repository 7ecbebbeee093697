//! Canonical RGBA window matrix with atomic write-batch commits.
//!
//! The matrix is the only cross-thread mutable surface the runtime owns.
//! Writers go through [`WindowMatrix::submit_write_batch`]; every other
//! consumer reads deep-copied snapshots. Each successful commit bumps the
//! revision by exactly one and pushes a [`CommitEvent`] onto the commit
//! queue, so the presentation side can coalesce bursts down to the newest
//! revision without ever observing a torn frame.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::warn;

mod ops;

pub use ops::{ColorMatrix, MAGENTA, PixelRect, Rgba8, RgbaF, WriteBatch, WriteOp};

/// Validation failures; every variant leaves the canonical matrix untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatrixError {
    #[error("matrix dimensions must be > 0")]
    ZeroDimension,
    #[error("write batch must include at least one operation")]
    EmptyBatch,
    #[error("pixel data has wrong length: expected {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("{label} out of range: {index} (extent {upper})")]
    IndexOutOfRange {
        label: &'static str,
        index: u32,
        upper: u32,
    },
    #[error("rect {x},{y} {width}x{height} exceeds matrix bounds {max_width}x{max_height}")]
    RectOutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },
    #[error("pixel data must contain only finite values")]
    NonFinitePixelData,
    #[error("color matrix must contain only finite values")]
    NonFiniteColorMatrix,
}

/// Emitted once per successful commit, in commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitEvent {
    pub event_id: u64,
    pub revision: u64,
    pub ts_ns: u64,
    /// Pixels replaced by the magenta sentinel across the whole batch.
    pub sanitized_pixels: u64,
}

/// Consumer handle over the commit-event stream.
///
/// FIFO with strictly increasing revisions. The queue is unbounded; the
/// display side is expected to drain it every tick.
#[derive(Debug, Clone)]
pub struct CommitQueue {
    rx: Receiver<CommitEvent>,
}

impl CommitQueue {
    /// Blocking pop with optional timeout; `None` timeout polls once.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<CommitEvent> {
        match timeout {
            Some(wait) => self.rx.recv_timeout(wait).ok(),
            None => self.rx.try_recv().ok(),
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<CommitEvent> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

struct MatrixState {
    grid: Vec<Rgba8>,
    revision: u64,
    next_event_id: u64,
}

/// HxW RGBA8 frame-buffer with revision-stamped atomic commits.
pub struct WindowMatrix {
    height: u32,
    width: u32,
    state: Mutex<MatrixState>,
    tx: Sender<CommitEvent>,
    rx: Receiver<CommitEvent>,
}

impl WindowMatrix {
    /// Build a matrix filled with `background`. Dimensions are fixed for
    /// the lifetime of the matrix.
    pub fn new(height: u32, width: u32, background: Rgba8) -> Result<Self, MatrixError> {
        if height == 0 || width == 0 {
            return Err(MatrixError::ZeroDimension);
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        Ok(Self {
            height,
            width,
            state: Mutex::new(MatrixState {
                grid: vec![background; height as usize * width as usize],
                revision: 0,
                next_event_id: 1,
            }),
            tx,
            rx,
        })
    }

    /// Black, opaque background.
    pub fn with_dimensions(height: u32, width: u32) -> Result<Self, MatrixError> {
        Self::new(height, width, [0, 0, 0, 255])
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn revision(&self) -> u64 {
        self.lock_state().revision
    }

    /// Deep-copied view of the canonical grid, row-major.
    pub fn snapshot(&self) -> Vec<Rgba8> {
        self.lock_state().grid.clone()
    }

    /// Handle for commit-event consumers. Cloned handles compete for
    /// events; the runtime wires exactly one display consumer.
    pub fn commit_queue(&self) -> CommitQueue {
        CommitQueue {
            rx: self.rx.clone(),
        }
    }

    pub fn pending_commit_count(&self) -> usize {
        self.rx.len()
    }

    /// Apply `batch` atomically: every operation against one staged copy,
    /// in order, with no canonical mutation on any validation failure.
    pub fn submit_write_batch(&self, batch: &WriteBatch) -> Result<CommitEvent, MatrixError> {
        if batch.is_empty() {
            return Err(MatrixError::EmptyBatch);
        }
        let mut state = self.lock_state();
        let mut staged = state.grid.clone();
        let mut sanitized_pixels = 0u64;
        for op in batch.ops() {
            sanitized_pixels += self.apply_op(&mut staged, op)?;
        }
        if sanitized_pixels > 0 {
            warn!(
                target: "matrix.commit",
                sanitized_pixels,
                "write batch carried invalid RGBA channels"
            );
        }
        state.grid = staged;
        state.revision += 1;
        let event = CommitEvent {
            event_id: state.next_event_id,
            revision: state.revision,
            ts_ns: now_ts_ns(),
            sanitized_pixels,
        };
        state.next_event_id += 1;
        // Sender and receiver are co-owned, so the channel never closes
        // while the matrix is alive.
        let _ = self.tx.send(event);
        Ok(event)
    }

    fn apply_op(&self, grid: &mut Vec<Rgba8>, op: &WriteOp) -> Result<u64, MatrixError> {
        let w = self.width as usize;
        let h = self.height as usize;
        match op {
            WriteOp::FullRewrite(rect) => {
                if rect.width() != self.width || rect.height() != self.height {
                    return Err(MatrixError::ShapeMismatch {
                        expected: w * h,
                        actual: rect.data().len(),
                    });
                }
                let (pixels, offending) = ops::sanitize_pixels(rect.data())?;
                *grid = pixels;
                Ok(offending)
            }
            WriteOp::ReplaceRect { x, y, rect } => {
                self.validate_rect(*x, *y, rect.width(), rect.height())?;
                let (pixels, offending) = ops::sanitize_pixels(rect.data())?;
                let rw = rect.width() as usize;
                for row in 0..rect.height() as usize {
                    let dst = (*y as usize + row) * w + *x as usize;
                    let src = row * rw;
                    grid[dst..dst + rw].copy_from_slice(&pixels[src..src + rw]);
                }
                Ok(offending)
            }
            WriteOp::PushColumn { index, column } => {
                let i = self.validate_column(*index, column)?;
                let (pixels, offending) = ops::sanitize_pixels(column)?;
                for row in 0..h {
                    let base = row * w;
                    for x in (i + 1..w).rev() {
                        grid[base + x] = grid[base + x - 1];
                    }
                    grid[base + i] = pixels[row];
                }
                Ok(offending)
            }
            WriteOp::ReplaceColumn { index, column } => {
                let i = self.validate_column(*index, column)?;
                let (pixels, offending) = ops::sanitize_pixels(column)?;
                for row in 0..h {
                    grid[row * w + i] = pixels[row];
                }
                Ok(offending)
            }
            WriteOp::PushRow { index, row } => {
                let i = self.validate_row(*index, row)?;
                let (pixels, offending) = ops::sanitize_pixels(row)?;
                for y in (i + 1..h).rev() {
                    grid.copy_within((y - 1) * w..y * w, y * w);
                }
                grid[i * w..(i + 1) * w].copy_from_slice(&pixels);
                Ok(offending)
            }
            WriteOp::ReplaceRow { index, row } => {
                let i = self.validate_row(*index, row)?;
                let (pixels, offending) = ops::sanitize_pixels(row)?;
                grid[i * w..(i + 1) * w].copy_from_slice(&pixels);
                Ok(offending)
            }
            WriteOp::Multiply(m) => {
                if !m.is_finite() {
                    return Err(MatrixError::NonFiniteColorMatrix);
                }
                for px in grid.iter_mut() {
                    *px = multiply_pixel(&m.0, *px);
                }
                Ok(0)
            }
        }
    }

    fn validate_column(&self, index: u32, column: &[RgbaF]) -> Result<usize, MatrixError> {
        if index >= self.width {
            return Err(MatrixError::IndexOutOfRange {
                label: "column index",
                index,
                upper: self.width,
            });
        }
        if column.len() != self.height as usize {
            return Err(MatrixError::ShapeMismatch {
                expected: self.height as usize,
                actual: column.len(),
            });
        }
        Ok(index as usize)
    }

    fn validate_row(&self, index: u32, row: &[RgbaF]) -> Result<usize, MatrixError> {
        if index >= self.height {
            return Err(MatrixError::IndexOutOfRange {
                label: "row index",
                index,
                upper: self.height,
            });
        }
        if row.len() != self.width as usize {
            return Err(MatrixError::ShapeMismatch {
                expected: self.width as usize,
                actual: row.len(),
            });
        }
        Ok(index as usize)
    }

    fn validate_rect(&self, x: u32, y: u32, width: u32, height: u32) -> Result<(), MatrixError> {
        if x.checked_add(width).is_none_or(|end| end > self.width)
            || y.checked_add(height).is_none_or(|end| end > self.height)
        {
            return Err(MatrixError::RectOutOfBounds {
                x,
                y,
                width,
                height,
                max_width: self.width,
                max_height: self.height,
            });
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MatrixState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// `p' = clamp(round_ties_even(M · p), 0, 255)` in f32.
fn multiply_pixel(m: &[[f32; 4]; 4], px: Rgba8) -> Rgba8 {
    let p = [
        f32::from(px[0]),
        f32::from(px[1]),
        f32::from(px[2]),
        f32::from(px[3]),
    ];
    let mut out = [0u8; 4];
    for (channel, row) in out.iter_mut().zip(m.iter()) {
        let sum: f32 = row.iter().zip(p.iter()).map(|(a, b)| a * b).sum();
        *channel = sum.round_ties_even().clamp(0.0, 255.0) as u8;
    }
    out
}

fn now_ts_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, rgba: RgbaF) -> PixelRect {
        PixelRect::solid(w, h, rgba).unwrap()
    }

    #[test]
    fn construction_rejects_zero_dimensions() {
        assert!(WindowMatrix::with_dimensions(0, 4).is_err());
        assert!(WindowMatrix::with_dimensions(4, 0).is_err());
    }

    #[test]
    fn empty_batch_is_rejected_without_state_change() {
        let matrix = WindowMatrix::with_dimensions(2, 2).unwrap();
        let before = matrix.snapshot();
        let err = matrix.submit_write_batch(&WriteBatch::new(Vec::new()));
        assert!(matches!(err, Err(MatrixError::EmptyBatch)));
        assert_eq!(matrix.snapshot(), before);
        assert_eq!(matrix.revision(), 0);
        assert_eq!(matrix.pending_commit_count(), 0);
    }

    #[test]
    fn failed_op_mid_batch_leaves_canonical_matrix_untouched() {
        let matrix = WindowMatrix::with_dimensions(2, 2).unwrap();
        let before = matrix.snapshot();
        let batch = WriteBatch::new(vec![
            WriteOp::FullRewrite(solid(2, 2, [9.0, 9.0, 9.0, 255.0])),
            WriteOp::ReplaceColumn {
                index: 5,
                column: vec![[0.0; 4]; 2],
            },
        ]);
        assert!(matrix.submit_write_batch(&batch).is_err());
        assert_eq!(matrix.snapshot(), before);
        assert_eq!(matrix.revision(), 0);
    }

    #[test]
    fn commit_increments_revision_by_one_and_queues_event() {
        let matrix = WindowMatrix::with_dimensions(2, 2).unwrap();
        let queue = matrix.commit_queue();
        for expected in 1..=3u64 {
            let event = matrix
                .submit_write_batch(&WriteBatch::single(WriteOp::FullRewrite(solid(
                    2,
                    2,
                    [1.0, 2.0, 3.0, 255.0],
                ))))
                .unwrap();
            assert_eq!(event.revision, expected);
        }
        let revisions: Vec<u64> = std::iter::from_fn(|| queue.try_pop())
            .map(|e| e.revision)
            .collect();
        assert_eq!(revisions, vec![1, 2, 3]);
    }

    #[test]
    fn ops_within_a_batch_observe_earlier_ops() {
        let matrix = WindowMatrix::with_dimensions(2, 2).unwrap();
        let batch = WriteBatch::new(vec![
            WriteOp::FullRewrite(solid(2, 2, [10.0, 10.0, 10.0, 255.0])),
            WriteOp::Multiply(ColorMatrix([
                [2.0, 0.0, 0.0, 0.0],
                [0.0, 2.0, 0.0, 0.0],
                [0.0, 0.0, 2.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ])),
        ]);
        matrix.submit_write_batch(&batch).unwrap();
        assert_eq!(matrix.snapshot()[0], [20, 20, 20, 255]);
    }

    #[test]
    fn replace_rect_blits_in_place() {
        let matrix = WindowMatrix::with_dimensions(3, 3).unwrap();
        let batch = WriteBatch::new(vec![
            WriteOp::FullRewrite(solid(3, 3, [1.0, 1.0, 1.0, 255.0])),
            WriteOp::ReplaceRect {
                x: 1,
                y: 1,
                rect: solid(2, 2, [7.0, 7.0, 7.0, 255.0]),
            },
        ]);
        matrix.submit_write_batch(&batch).unwrap();
        let grid = matrix.snapshot();
        assert_eq!(grid[0], [1, 1, 1, 255]);
        assert_eq!(grid[4], [7, 7, 7, 255]);
        assert_eq!(grid[8], [7, 7, 7, 255]);
        assert_eq!(grid[2], [1, 1, 1, 255]);
    }

    #[test]
    fn replace_rect_rejects_out_of_bounds() {
        let matrix = WindowMatrix::with_dimensions(3, 3).unwrap();
        let err = matrix.submit_write_batch(&WriteBatch::single(WriteOp::ReplaceRect {
            x: 2,
            y: 2,
            rect: solid(2, 2, [0.0, 0.0, 0.0, 255.0]),
        }));
        assert!(matches!(err, Err(MatrixError::RectOutOfBounds { .. })));
    }

    #[test]
    fn push_column_twice_shifts_original_by_two() {
        let matrix = WindowMatrix::with_dimensions(1, 4).unwrap();
        let col = |v: f32| vec![[v, 0.0, 0.0, 255.0]];
        // Distinct column colors: [10, 11, 12, 13].
        matrix
            .submit_write_batch(&WriteBatch::new(vec![
                WriteOp::ReplaceColumn { index: 0, column: col(10.0) },
                WriteOp::ReplaceColumn { index: 1, column: col(11.0) },
                WriteOp::ReplaceColumn { index: 2, column: col(12.0) },
                WriteOp::ReplaceColumn { index: 3, column: col(13.0) },
            ]))
            .unwrap();
        matrix
            .submit_write_batch(&WriteBatch::new(vec![
                WriteOp::PushColumn { index: 1, column: col(20.0) },
                WriteOp::PushColumn { index: 1, column: col(21.0) },
            ]))
            .unwrap();
        let reds: Vec<u8> = matrix.snapshot().iter().map(|px| px[0]).collect();
        // Original column 1 now sits at index 3; 12 and 13 were evicted.
        assert_eq!(reds, vec![10, 21, 20, 11]);
    }

    #[test]
    fn push_row_shifts_down_and_evicts_last() {
        let matrix = WindowMatrix::with_dimensions(3, 1).unwrap();
        let row = |v: f32| vec![[v, 0.0, 0.0, 255.0]];
        matrix
            .submit_write_batch(&WriteBatch::new(vec![
                WriteOp::ReplaceRow { index: 0, row: row(1.0) },
                WriteOp::ReplaceRow { index: 1, row: row(2.0) },
                WriteOp::ReplaceRow { index: 2, row: row(3.0) },
                WriteOp::PushRow { index: 0, row: row(9.0) },
            ]))
            .unwrap();
        let reds: Vec<u8> = matrix.snapshot().iter().map(|px| px[0]).collect();
        assert_eq!(reds, vec![9, 1, 2]);
    }

    #[test]
    fn multiply_identity_is_bit_exact() {
        let matrix = WindowMatrix::with_dimensions(2, 2).unwrap();
        matrix
            .submit_write_batch(&WriteBatch::single(WriteOp::FullRewrite(
                PixelRect::new(
                    2,
                    2,
                    vec![
                        [1.0, 2.0, 3.0, 255.0],
                        [4.0, 5.0, 6.0, 255.0],
                        [7.0, 8.0, 9.0, 255.0],
                        [10.0, 11.0, 12.0, 255.0],
                    ],
                )
                .unwrap(),
            )))
            .unwrap();
        let before = matrix.snapshot();
        matrix
            .submit_write_batch(&WriteBatch::single(WriteOp::Multiply(
                ColorMatrix::IDENTITY,
            )))
            .unwrap();
        assert_eq!(matrix.snapshot(), before);
    }

    #[test]
    fn multiply_rejects_non_finite_matrix() {
        let matrix = WindowMatrix::with_dimensions(1, 1).unwrap();
        let mut m = ColorMatrix::IDENTITY;
        m.0[0][0] = f32::NAN;
        let err = matrix.submit_write_batch(&WriteBatch::single(WriteOp::Multiply(m)));
        assert!(matches!(err, Err(MatrixError::NonFiniteColorMatrix)));
        assert_eq!(matrix.revision(), 0);
    }

    #[test]
    fn multiply_rounds_ties_to_even() {
        let matrix = WindowMatrix::with_dimensions(1, 1).unwrap();
        matrix
            .submit_write_batch(&WriteBatch::new(vec![
                WriteOp::FullRewrite(solid(1, 1, [1.0, 3.0, 5.0, 255.0])),
                WriteOp::Multiply(ColorMatrix([
                    [0.5, 0.0, 0.0, 0.0],
                    [0.0, 0.5, 0.0, 0.0],
                    [0.0, 0.0, 0.5, 0.0],
                    [0.0, 0.0, 0.0, 1.0],
                ])),
            ]))
            .unwrap();
        // 0.5 -> 0, 1.5 -> 2, 2.5 -> 2 under ties-to-even.
        assert_eq!(matrix.snapshot()[0], [0, 2, 2, 255]);
    }

    #[test]
    fn sanitized_pixel_count_is_aggregated_per_batch() {
        let matrix = WindowMatrix::with_dimensions(1, 2).unwrap();
        let event = matrix
            .submit_write_batch(&WriteBatch::new(vec![
                WriteOp::FullRewrite(
                    PixelRect::new(2, 1, vec![[300.0, 0.0, 0.0, 255.0], [1.0, 1.0, 1.0, 255.0]])
                        .unwrap(),
                ),
                WriteOp::ReplaceColumn {
                    index: 1,
                    column: vec![[-4.0, 0.0, 0.0, 255.0]],
                },
            ]))
            .unwrap();
        assert_eq!(event.sanitized_pixels, 2);
        let grid = matrix.snapshot();
        assert_eq!(grid[0], MAGENTA);
        assert_eq!(grid[1], MAGENTA);
    }

    #[test]
    fn non_finite_pixel_data_fails_before_any_mutation() {
        let matrix = WindowMatrix::with_dimensions(1, 2).unwrap();
        let before = matrix.snapshot();
        let err = matrix.submit_write_batch(&WriteBatch::single(WriteOp::ReplaceRow {
            index: 0,
            row: vec![[f32::NAN, 0.0, 0.0, 255.0], [0.0, 0.0, 0.0, 255.0]],
        }));
        assert!(matches!(err, Err(MatrixError::NonFinitePixelData)));
        assert_eq!(matrix.snapshot(), before);
        assert_eq!(matrix.pending_commit_count(), 0);
    }
}
