//! Summing several streams into one interleaved output buffer
//!
//! Runs inside the audio callback, so it only pops samples and adds.

/// Anything the mixer can pull interleaved samples from
pub trait SampleSource {
    /// Channels per frame in the source's queue
    fn channels(&self) -> usize;

    fn is_ready(&self) -> bool;

    /// Next sample, or silence when the queue is empty
    fn pop_or_silence(&self) -> f32;
}

/// Sum every ready source into `out` (interleaved, `channels` per frame).
///
/// A mono source is spread to every output channel. Source channels beyond
/// the output's are consumed and dropped, keeping the source's frames
/// aligned.
pub fn mix_into<S, I>(sources: I, out: &mut [f32], channels: usize)
where
    S: SampleSource + ?Sized,
    I: IntoIterator,
    I::Item: AsRef<S>,
{
    out.fill(0.0);
    if channels == 0 {
        return;
    }

    for source in sources {
        let source = source.as_ref();
        if !source.is_ready() {
            continue;
        }
        let src_channels = source.channels();
        if src_channels == 0 {
            continue;
        }

        for frame in out.chunks_exact_mut(channels) {
            if src_channels == 1 {
                let sample = source.pop_or_silence();
                for slot in frame.iter_mut() {
                    *slot += sample;
                }
                continue;
            }
            for c in 0..src_channels {
                let sample = source.pop_or_silence();
                if let Some(slot) = frame.get_mut(c) {
                    *slot += sample;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use parking_lot::Mutex;

    struct Fake {
        channels: usize,
        ready: bool,
        samples: Mutex<VecDeque<f32>>,
    }

    impl Fake {
        fn new(channels: usize, ready: bool, samples: &[f32]) -> Arc<Self> {
            Arc::new(Self {
                channels,
                ready,
                samples: Mutex::new(samples.iter().copied().collect()),
            })
        }
    }

    impl SampleSource for Fake {
        fn channels(&self) -> usize {
            self.channels
        }

        fn is_ready(&self) -> bool {
            self.ready
        }

        fn pop_or_silence(&self) -> f32 {
            self.samples.lock().pop_front().unwrap_or(0.0)
        }
    }

    #[test]
    fn test_sums_ready_sources() {
        let a = Fake::new(2, true, &[0.1, 0.2, 0.3, 0.4]);
        let b = Fake::new(2, true, &[1.0, 1.0]);
        let idle = Fake::new(2, false, &[5.0; 4]);

        let mut out = [9.0f32; 4];
        mix_into::<Fake, _>(vec![a, b, idle.clone()], &mut out, 2);

        assert!((out[0] - 1.1).abs() < 1e-6);
        assert!((out[1] - 1.2).abs() < 1e-6);
        assert!((out[2] - 0.3).abs() < 1e-6);
        assert!((out[3] - 0.4).abs() < 1e-6);
        assert_eq!(idle.samples.lock().len(), 4);
    }

    #[test]
    fn test_mono_spreads_and_extra_channels_drop() {
        let mono = Fake::new(1, true, &[0.5, 0.25]);
        let mut out = [0.0f32; 4];
        mix_into::<Fake, _>(vec![mono], &mut out, 2);
        assert_eq!(out, [0.5, 0.5, 0.25, 0.25]);

        let quad = Fake::new(4, true, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let mut out = [0.0f32; 4];
        mix_into::<Fake, _>(vec![quad], &mut out, 2);
        assert_eq!(out, [1.0, 2.0, 5.0, 6.0]);
    }
}
