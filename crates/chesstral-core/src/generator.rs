use crate::error::Result;

/// A causal language model the inference worker can drive token by token.
///
/// Implementations are owned by exactly one worker thread, so they are free
/// to keep mutable state such as an attention KV cache.
pub trait TextGenerator: Send + 'static {
    /// Forget all cached state before a new prompt is processed.
    fn reset(&mut self);

    /// Feed `tokens`, the first of which sits at position `offset`, and
    /// return the logits for the position after the last one.
    fn forward(&mut self, tokens: &[u32], offset: usize) -> Result<Vec<f32>>;

    /// Maximum number of positions (prompt + generated) the model supports.
    fn context_length(&self) -> usize;
}

impl<G: TextGenerator + ?Sized> TextGenerator for Box<G> {
    fn reset(&mut self) {
        (**self).reset()
    }

    fn forward(&mut self, tokens: &[u32], offset: usize) -> Result<Vec<f32>> {
        (**self).forward(tokens, offset)
    }

    fn context_length(&self) -> usize {
        (**self).context_length()
    }
}
