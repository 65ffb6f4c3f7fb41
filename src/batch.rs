use crate::error::{BridgeError, Result};
use crate::{sys, token::TokenId};

/// Token batch owned by the Rust side
pub struct Batch {
    inner: sys::llama_batch,
    capacity: usize,
    n_seq_max: usize,
}

impl Batch {
    /// Create a batch holding up to `max_tokens` tokens
    pub fn new(max_tokens: usize, embd: i32, max_seq: usize) -> Self {
        let inner = unsafe { sys::llama_batch_init(max_tokens as i32, embd, max_seq as i32) };

        Self {
            inner,
            capacity: max_tokens,
            n_seq_max: max_seq,
        }
    }

    /// Forget every queued token
    pub fn clear(&mut self) {
        self.inner.n_tokens = 0;
    }

    /// Append one token at `pos` for the given sequences
    pub fn push(&mut self, token: TokenId, pos: i32, seq_ids: &[i32], logits: bool) -> Result<()> {
        let i = self.len();
        if i >= self.capacity {
            return Err(BridgeError::EngineFailure(format!(
                "batch is full ({} tokens)",
                self.capacity
            )));
        }
        if seq_ids.len() > self.n_seq_max {
            return Err(BridgeError::EngineFailure(format!(
                "batch holds at most {} sequence ids per token",
                self.n_seq_max
            )));
        }

        unsafe {
            *self.inner.token.add(i) = token;
            *self.inner.pos.add(i) = pos;
            *self.inner.n_seq_id.add(i) = seq_ids.len() as i32;
            let seq_slot = *self.inner.seq_id.add(i);
            for (j, seq_id) in seq_ids.iter().enumerate() {
                *seq_slot.add(j) = *seq_id;
            }
            *self.inner.logits.add(i) = logits as i8;
        }
        self.inner.n_tokens += 1;
        Ok(())
    }

    /// Request logits for the most recently pushed token
    pub fn mark_last_logits(&mut self) {
        if let Some(last) = self.len().checked_sub(1) {
            unsafe {
                *self.inner.logits.add(last) = 1;
            }
        }
    }

    /// Copy of the raw struct for `llama_decode`, which takes it by value
    pub(crate) fn as_llama_batch(&self) -> sys::llama_batch {
        self.inner.clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.n_tokens as usize
    }

    pub fn is_empty(&self) -> bool {
        self.inner.n_tokens == 0
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        unsafe {
            sys::llama_batch_free(self.inner.clone());
        }
    }
}

/// Decode `tokens` starting at position `start`, in chunks no larger than
/// the batch; logits are requested for the final token only
///
/// # Safety
///
/// `context` must be a live llama context.
pub(crate) unsafe fn decode_tokens(
    context: *mut sys::llama_context,
    batch: &mut Batch,
    tokens: &[TokenId],
    start: i32,
) -> Result<()> {
    let chunk_size = batch.capacity().max(1);
    let last_chunk = tokens.len().saturating_sub(1) / chunk_size;

    for (chunk_index, chunk) in tokens.chunks(chunk_size).enumerate() {
        batch.clear();
        let offset = (chunk_index * chunk_size) as i32;
        for (i, token) in chunk.iter().enumerate() {
            batch.push(*token, start + offset + i as i32, &[0], false)?;
        }
        if chunk_index == last_chunk {
            batch.mark_last_logits();
        }
        let status = sys::llama_decode(context, batch.as_llama_batch());
        if status != 0 {
            return Err(BridgeError::EngineFailure(format!(
                "llama_decode() failed with status {}",
                status
            )));
        }
    }
    Ok(())
}
