use memmap2::Mmap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use super::error::{MeterError, MeterResult};
use super::generate_signal::{generate_phase_frames, SignalProfile};
use super::types::*;

const SPI_CLOCK_HZ: u32 = 1_250_000;
const FRAME_BYTES: usize = ADC_CHANNELS * 4;

/// Raw sample source for one phase.
pub trait AcquisitionDriver {
    /// Read `sample_count` frames; every frame carries one reading per physical
    /// channel in fixed order, channels outside `mask` read 0. Either the whole
    /// batch is returned or the call fails.
    fn read(&mut self, mask: ChannelMask, sample_count: usize) -> MeterResult<Vec<AdcFrame>>;
}

/// MCP3008 read through the `mcp3008hwspi` helper binary.
#[derive(Debug, Clone)]
pub struct SpiHelperAdc {
    exec_path: PathBuf,
    device: u32,
}

impl SpiHelperAdc {
    pub fn new(exec_path: impl Into<PathBuf>, device: u32) -> Self {
        Self {
            exec_path: exec_path.into(),
            device,
        }
    }
}

/*
* @brief Parse the CSV lines printed by the SPI helper.
* @param output Helper stdout, one line per frame
* @param mask Channels requested, values appear in channel order
* @param sample_count Frames expected
* @return Frames in physical channel layout
*/
pub fn parse_helper_output(output: &str, mask: ChannelMask, sample_count: usize) -> MeterResult<Vec<AdcFrame>> {
    let channels: Vec<usize> = (0..ADC_CHANNELS).filter(|&c| mask.contains(c)).collect();
    let mut frames = Vec::with_capacity(sample_count);

    for line in output.lines().take_while(|l| !l.trim().is_empty()).take(sample_count) {
        let mut frame = [0; ADC_CHANNELS];
        let values: Vec<&str> = line.split(',').map(str::trim).collect();
        if values.len() != channels.len() {
            return Err(MeterError::Acquisition(format!(
                "expected {} values per line, got {} in {:?}",
                channels.len(),
                values.len(),
                line
            )));
        }
        for (&channel, value) in channels.iter().zip(values) {
            frame[channel] = value
                .parse::<i32>()
                .map_err(|e| MeterError::Acquisition(format!("bad sample {:?}: {}", value, e)))?;
        }
        frames.push(frame);
    }

    if frames.len() != sample_count {
        return Err(MeterError::Acquisition(format!(
            "short read: {} of {} frames",
            frames.len(),
            sample_count
        )));
    }

    Ok(frames)
}

impl AcquisitionDriver for SpiHelperAdc {
    fn read(&mut self, mask: ChannelMask, sample_count: usize) -> MeterResult<Vec<AdcFrame>> {
        let output = Command::new(&self.exec_path)
            .args(["-r", &SPI_CLOCK_HZ.to_string()])
            .args(["-c", &mask.as_digits()])
            .args(["-f", "0"])
            .args(["-n", &sample_count.to_string()])
            .args(["-b", "1"])
            .args(["-d", &self.device.to_string()])
            .output()
            .map_err(|e| MeterError::Acquisition(format!("{}: {}", self.exec_path.display(), e)))?;

        if !output.status.success() {
            return Err(MeterError::Acquisition(format!(
                "{} exited with {}: {}",
                self.exec_path.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_helper_output(&String::from_utf8_lossy(&output.stdout), mask, sample_count)
    }
}

/// Synthetic ADC producing continuous waveforms from a signal profile.
#[derive(Debug, Clone)]
pub struct SimulatedAdc {
    profile: SignalProfile,
    calibration: PhaseCalibration,
    bias_counts: i32,
    sample_rate: f64,
    position: u64,
    pace: bool,
}

impl SimulatedAdc {
    pub fn new(profile: SignalProfile, calibration: PhaseCalibration, bias_counts: i32, sample_rate: f64) -> Self {
        Self {
            profile,
            calibration,
            bias_counts,
            sample_rate,
            position: 0,
            pace: false,
        }
    }

    /// Sleep for the duration a real ADC would need for each batch.
    pub fn paced(mut self, pace: bool) -> Self {
        self.pace = pace;
        self
    }
}

impl AcquisitionDriver for SimulatedAdc {
    fn read(&mut self, mask: ChannelMask, sample_count: usize) -> MeterResult<Vec<AdcFrame>> {
        let mut frames = generate_phase_frames(
            &self.profile,
            &self.calibration,
            self.bias_counts,
            self.sample_rate,
            self.position,
            sample_count,
        );
        self.position += sample_count as u64;

        for frame in frames.iter_mut() {
            for (channel, value) in frame.iter_mut().enumerate() {
                if !mask.contains(channel) {
                    *value = 0;
                }
            }
        }

        if self.pace && self.sample_rate > 0.0 {
            spin_sleep::sleep(Duration::from_secs_f64(sample_count as f64 / self.sample_rate));
        }

        Ok(frames)
    }
}

/// Replays a recorded capture (little endian i32, 8 channels per frame) from a memory map.
pub struct ReplayAdc {
    map: Mmap,
    frames: usize,
    position: usize,
}

impl ReplayAdc {
    pub fn open(path: impl AsRef<Path>) -> MeterResult<Self> {
        let file = File::open(path.as_ref())?;
        // SAFETY: captures are not modified while they are replayed.
        let map = unsafe { Mmap::map(&file)? };

        if map.is_empty() || map.len() % FRAME_BYTES != 0 {
            return Err(MeterError::Acquisition(format!(
                "{} is not a capture of {}-byte frames ({} bytes)",
                path.as_ref().display(),
                FRAME_BYTES,
                map.len()
            )));
        }

        let frames = map.len() / FRAME_BYTES;
        Ok(Self {
            map,
            frames,
            position: 0,
        })
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    fn frame_at(&self, index: usize) -> AdcFrame {
        let base = index * FRAME_BYTES;
        let mut frame = [0; ADC_CHANNELS];
        for (channel, value) in frame.iter_mut().enumerate() {
            let at = base + channel * 4;
            *value = i32::from_le_bytes([self.map[at], self.map[at + 1], self.map[at + 2], self.map[at + 3]]);
        }
        frame
    }
}

impl AcquisitionDriver for ReplayAdc {
    fn read(&mut self, mask: ChannelMask, sample_count: usize) -> MeterResult<Vec<AdcFrame>> {
        let mut frames = Vec::with_capacity(sample_count);
        for _ in 0..sample_count {
            let mut frame = self.frame_at(self.position);
            for (channel, value) in frame.iter_mut().enumerate() {
                if !mask.contains(channel) {
                    *value = 0;
                }
            }
            frames.push(frame);
            self.position = (self.position + 1) % self.frames;
        }
        Ok(frames)
    }
}

/*
* @brief Capture file of a phase.
* @param base A single capture shared by every phase, or a directory of per-phase captures
* @param phase 0-based phase index
* @return `base/capture-phase{N}.bin` when base is a directory, base otherwise
*/
pub fn capture_path(base: &Path, phase: usize) -> PathBuf {
    if base.is_dir() {
        base.join(format!("capture-phase{}.bin", phase + 1))
    } else {
        base.to_path_buf()
    }
}

/// Record frames in the layout ReplayAdc reads.
pub fn write_capture(path: impl AsRef<Path>, frames: &[AdcFrame]) -> MeterResult<()> {
    let mut file = File::create(path)?;
    for frame in frames {
        for value in frame {
            file.write_all(&value.to_le_bytes())?;
        }
    }
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_helper_output() {
        let out = "510,511,512,600,513,514,515,511\n400,401,402,403,404,405,406,407\n";
        let frames = parse_helper_output(out, ChannelMask::ALL, 2).unwrap();
        assert_eq!(frames[0][3], 600);
        assert_eq!(frames[1][7], 407);
    }

    #[test]
    fn maps_masked_helper_columns_to_channels() {
        let out = "1,2,3\n";
        let frames = parse_helper_output(out, ChannelMask::from_channels(&[0, 3, 7]), 1).unwrap();
        assert_eq!(frames[0], [1, 0, 0, 2, 0, 0, 0, 3]);
    }

    #[test]
    fn short_helper_output_fails_whole_batch() {
        let out = "1,2,3,4,5,6,7,8\n\n";
        assert!(matches!(
            parse_helper_output(out, ChannelMask::ALL, 2),
            Err(MeterError::Acquisition(_))
        ));
        assert!(parse_helper_output("1,2\n", ChannelMask::ALL, 1).is_err());
    }

    #[test]
    fn replay_wraps_around_capture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        let frames: Vec<AdcFrame> = (0..3).map(|i| [i; ADC_CHANNELS]).collect();
        write_capture(&path, &frames).unwrap();

        let mut adc = ReplayAdc::open(&path).unwrap();
        assert_eq!(adc.frames(), 3);

        let read = adc.read(ChannelMask::from_channels(&[0, 1]), 4).unwrap();
        assert_eq!(read[0], [0; ADC_CHANNELS]);
        assert_eq!(read[2][1], 2);
        assert_eq!(read[2][2], 0); // masked out
        assert_eq!(read[3][0], 0); // wrapped to the first frame
    }

    #[test]
    fn replay_rejects_truncated_capture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.bin");
        std::fs::write(&path, [0u8; 10]).unwrap();
        assert!(ReplayAdc::open(&path).is_err());
    }

    #[test]
    fn simulated_adc_is_continuous_between_reads() {
        let calibration = PhaseCalibration {
            vac_channel: 3,
            vac_factor: 0.5,
            bias_channel: 7,
            bias_factor: 1.0,
            cts: Vec::new(),
        };
        let mut adc = SimulatedAdc::new(SignalProfile::default(), calibration.clone(), 512, 20_000.0);
        let first = adc.read(ChannelMask::ALL, 10).unwrap();
        let second = adc.read(ChannelMask::ALL, 10).unwrap();

        let mut one_shot = SimulatedAdc::new(SignalProfile::default(), calibration, 512, 20_000.0);
        let both = one_shot.read(ChannelMask::ALL, 20).unwrap();

        assert_eq!(&both[..10], &first[..]);
        assert_eq!(&both[10..], &second[..]);
    }

    #[test]
    fn captures_are_found_per_phase_in_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(dir.path().join("capture-phase1.bin"), &[[1; ADC_CHANNELS]]).unwrap();
        write_capture(dir.path().join("capture-phase2.bin"), &[[2; ADC_CHANNELS]]).unwrap();

        let mask = ChannelMask::from_channels(&[0]);
        let mut second = ReplayAdc::open(capture_path(dir.path(), 1)).unwrap();
        assert_eq!(second.read(mask, 1).unwrap()[0][0], 2);

        let single = dir.path().join("capture-phase1.bin");
        assert_eq!(capture_path(&single, 1), single);
    }
}
