//! Reading output buffers back after the application submits work.
//!
//! A submission that carries instrumented commands is followed by a one-barrier command buffer
//! on the same queue, then the queue is drained and each output buffer is decoded and cleared.
//! Submissions without debug printf resources take the fast path and touch nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;
use tracing::{debug, warn};

use crate::config::BUFFER_SIZE_ENV;
use crate::context::DeviceContext;
use crate::decode::{OutputDecoder, RecordContext};
use crate::error::ResourceError;
use crate::report::{Diagnostic, DiagnosticKind};
use crate::resources::PerInvocationResource;

/// How far [`SubmissionInterceptor::post_submit`] got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitState {
    /// Nothing to read back.
    Idle,
    BarrierInserted,
    WaitCompleted,
    Decoded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionReport {
    pub state: SubmitState,
    pub buffers_decoded: usize,
    pub messages: usize,
    pub truncated_buffers: usize,
}

impl SubmissionReport {
    fn idle() -> Self {
        Self {
            state: SubmitState::Idle,
            buffers_decoded: 0,
            messages: 0,
            truncated_buffers: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QueueBarrier {
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
}

pub struct SubmissionInterceptor {
    ctx: Arc<DeviceContext>,
    decoder: Arc<OutputDecoder>,
    barriers: Mutex<HashMap<vk::Queue, QueueBarrier>>,
}

impl SubmissionInterceptor {
    pub fn new(ctx: Arc<DeviceContext>, decoder: Arc<OutputDecoder>) -> Self {
        Self {
            ctx,
            decoder,
            barriers: Mutex::new(HashMap::new()),
        }
    }

    /// Reads back `batches` after the application's submission to `queue` succeeded.
    pub fn post_submit(
        &self,
        queue: vk::Queue,
        queue_family_index: u32,
        batches: &[(vk::CommandBuffer, Vec<PerInvocationResource>)],
    ) -> SubmissionReport {
        let mut report = SubmissionReport::idle();
        if self.ctx.is_aborted() || batches.iter().all(|(_, resources)| resources.is_empty()) {
            return report;
        }

        let barrier = match self.barrier_for(queue, queue_family_index) {
            Ok(barrier) => barrier,
            Err(err) => {
                self.fail(err, queue);
                return report;
            }
        };
        if let Err(err) =
            self.ctx
                .dispatch
                .queue_submit(queue, &[barrier.command_buffer], vk::Fence::null())
        {
            self.fail(ResourceError::BarrierSubmit(err), queue);
            return report;
        }
        self.ctx.stats.inc_barriers_submitted();
        report.state = SubmitState::BarrierInserted;

        if let Err(err) = self.ctx.dispatch.queue_wait_idle(queue) {
            self.fail(ResourceError::QueueWaitIdle(err), queue);
            return report;
        }
        report.state = SubmitState::WaitCompleted;

        for (command_buffer, resources) in batches {
            for resource in resources {
                let context = RecordContext {
                    queue,
                    command_buffer: *command_buffer,
                    pipeline: resource.pipeline,
                    kind: resource.kind,
                    operation_index: resource.operation_index,
                };
                match self.read_back(resource, &context) {
                    Ok((messages, truncated)) => {
                        report.buffers_decoded += 1;
                        report.messages += messages;
                        report.truncated_buffers += usize::from(truncated);
                    }
                    Err(err) => {
                        warn!(?command_buffer, %err, "skipping output buffer");
                        self.fail(err, queue);
                    }
                }
            }
        }
        report.state = SubmitState::Decoded;
        debug!(?queue, ?report, "debug printf readback complete");
        report
    }

    fn read_back(
        &self,
        resource: &PerInvocationResource,
        context: &RecordContext,
    ) -> Result<(usize, bool), ResourceError> {
        let memory = resource.block.memory;
        let mut bytes = vec![0u8; resource.block.size as usize];
        self.ctx
            .dispatch
            .read_memory(memory, 0, &mut bytes)
            .map_err(ResourceError::MemoryAccess)?;

        let decoded = self.decoder.decode_bytes(&mut bytes, context);

        for message in &decoded.messages {
            self.ctx.reporter.printf(message);
        }
        if decoded.truncated {
            self.ctx.stats.inc_truncated_buffers();
            self.ctx.report(
                Diagnostic::new(
                    DiagnosticKind::TruncationWarning,
                    format!(
                        "debug printf output buffer too small: shaders wrote {} words, {} fit. \
                         Increase the buffer size with {BUFFER_SIZE_ENV}.",
                        decoded.expected_words, decoded.consumed_words
                    ),
                )
                .with_object(context.command_buffer),
            );
        }
        self.ctx
            .stats
            .add_records_decoded(decoded.messages.len() as u64);
        self.ctx
            .stats
            .add_unknown_shader_records(decoded.unknown_shaders as u64);

        // Records left in the buffer would be decoded again by the next submission.
        let cleared = decoded.cleared_words * 4;
        if cleared > 0 {
            if let Err(err) = self.ctx.dispatch.write_memory(memory, 0, &bytes[..cleared]) {
                self.fail(ResourceError::MemoryAccess(err), context.queue);
            }
        }
        Ok((decoded.messages.len(), decoded.truncated))
    }

    fn barrier_for(
        &self,
        queue: vk::Queue,
        queue_family_index: u32,
    ) -> Result<QueueBarrier, ResourceError> {
        let mut barriers = self.barriers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(barrier) = barriers.get(&queue) {
            return Ok(*barrier);
        }

        let dispatch = &self.ctx.dispatch;
        let pool = dispatch
            .create_command_pool(queue_family_index)
            .map_err(ResourceError::BarrierCommandBuffer)?;
        let recorded = dispatch
            .allocate_primary_command_buffer(pool)
            .and_then(|cb| dispatch.record_host_read_barrier(cb).map(|()| cb));
        let command_buffer = match recorded {
            Ok(cb) => cb,
            Err(err) => {
                dispatch.destroy_command_pool(pool);
                return Err(ResourceError::BarrierCommandBuffer(err));
            }
        };

        let barrier = QueueBarrier {
            pool,
            command_buffer,
        };
        barriers.insert(queue, barrier);
        debug!(?queue, queue_family_index, "recorded host-read barrier command buffer");
        Ok(barrier)
    }

    fn fail(&self, err: ResourceError, queue: vk::Queue) {
        self.ctx.abort(
            Diagnostic::new(DiagnosticKind::ResourceExhaustion, err.to_string()).with_object(queue),
        );
    }

    /// Destroys the per-queue barrier command pools.
    pub fn destroy(&self) {
        let mut barriers = self.barriers.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, barrier) in barriers.drain() {
            self.ctx.dispatch.destroy_command_pool(barrier.pool);
        }
    }
}

impl std::fmt::Debug for SubmissionInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionInterceptor")
            .finish_non_exhaustive()
    }
}
