//! Audio subsystem: shared ring, sample queue, resampling and output

pub mod device;
pub mod mixer;
pub mod playback;
pub mod queue;
pub mod resample;
pub mod ring;

pub use device::{list_output_devices, AudioDeviceInfo};
pub use mixer::{mix_into, SampleSource};
pub use playback::{AudioPlayback, PlaybackSources};
pub use queue::{OverflowPolicy, SampleQueue};
pub use resample::{
    build_resampler, resampled_len, LinearResampler, Resampler, ResamplerKind, SincResampler,
};
pub use ring::{RingLayout, RingReader, RingWriter, HEADER_LEN};
