// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
//! The capability a worker loads and calls against a batch. One `Compute`
//! instance is constructed per worker task and lives for the task's
//! lifetime; there's no downcasting or dynamic dispatch back out of it once
//! it's handed to the aggregator (spec.md 9's design note).

use crate::errors::PredictError;

/// Generalizes the teacher's `Processor` trait (`backend/processor/mod.rs`)
/// from "fragment/defragment a Redis command" to "preprocess/predict/
/// postprocess a batch item", the shape spec.md 4.3/4.4 calls for. Trait
/// methods are synchronous: batching already happened upstream in the
/// aggregator, so a `Compute` implementation is expected to run on a
/// blocking thread or, for CPU-light transforms, inline.
pub trait Compute: Send + Sync + 'static {
    /// A single item's in-flight representation between the pipeline
    /// stages, e.g. a decoded tensor.
    type Item: Send;

    /// Decodes one request's raw payload into `Item`. Runs per-item,
    /// before batching, so a bad individual request doesn't fail its
    /// batch-mates.
    fn preprocess(&self, raw: &[u8]) -> Result<Self::Item, PredictError>;

    /// Runs inference over an entire batch at once. Implementations that
    /// return a different number of items than they were given trip
    /// `PredictError::ShapeMismatch` in the aggregator (spec.md 4.3's
    /// `onShapeMismatch` edge case).
    fn predict(&self, batch: Vec<Self::Item>) -> Result<Vec<Self::Item>, PredictError>;

    /// Encodes one predicted `Item` back into wire bytes.
    fn postprocess(&self, item: Self::Item) -> Vec<u8>;
}

/// Validates that `predict` returned one reply per request, per spec.md
/// 4.3's `onShapeMismatch` contract. A mismatch is not itself fatal to the
/// batch -- see `OnShapeMismatch` in the aggregator for how the answered
/// prefix and the unanswered tail are handled separately.
pub fn check_batch_shape<T>(expected: usize, got: &[T]) -> Result<(), PredictError> {
    if got.len() != expected {
        return Err(PredictError::ShapeMismatch { expected, got: got.len() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Compute for Echo {
        type Item = Vec<u8>;

        fn preprocess(&self, raw: &[u8]) -> Result<Self::Item, PredictError> { Ok(raw.to_vec()) }

        fn predict(&self, batch: Vec<Self::Item>) -> Result<Vec<Self::Item>, PredictError> { Ok(batch) }

        fn postprocess(&self, item: Self::Item) -> Vec<u8> { item }
    }

    #[test]
    fn echo_round_trips_a_batch() {
        let compute = Echo;
        let items = vec![compute.preprocess(b"a").unwrap(), compute.preprocess(b"b").unwrap()];
        let predicted = compute.predict(items).unwrap();
        check_batch_shape(2, &predicted).unwrap();
        let out: Vec<Vec<u8>> = predicted.into_iter().map(|i| compute.postprocess(i)).collect();
        assert_eq!(out, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn shape_mismatch_is_detected() {
        let got: Vec<u8> = vec![1, 2];
        let err = check_batch_shape(3, &got).unwrap_err();
        assert!(matches!(err, PredictError::ShapeMismatch { expected: 3, got: 2 }));
    }
}
