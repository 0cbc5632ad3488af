// src/audio_io.rs

use crate::audio_engine::{AudioEngine, OUTPUT_CHANNELS};
use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, Device, FromSample, Host, HostId, Sample, SampleFormat, Stream, StreamConfig,
    SupportedBufferSize,
};
use log::{error, info, warn};
use ringbuf::HeapProducer;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Devices and stream configs agreed on before the engine is built, so the
/// engine knows the sample rate and input width it will run at.
pub struct DeviceSetup {
    pub input_device: Device,
    pub output_device: Device,
    pub input_config: StreamConfig,
    pub output_config: StreamConfig,
    pub sample_format: SampleFormat,
}

impl DeviceSetup {
    pub fn sample_rate(&self) -> u32 {
        self.output_config.sample_rate.0
    }

    pub fn input_channels(&self) -> usize {
        self.input_config.channels as usize
    }

    pub fn buffer_size(&self) -> u32 {
        match self.output_config.buffer_size {
            BufferSize::Fixed(size) => size,
            BufferSize::Default => 512, // A reasonable assumption if default
        }
    }
}

fn find_device(
    host: &Host,
    name: Option<&String>,
    input: bool,
) -> Result<Device> {
    if let Some(name) = name {
        let mut devices = if input {
            host.input_devices()?
        } else {
            host.output_devices()?
        };
        if let Some(device) = devices.find(|d| d.name().ok().as_ref() == Some(name)) {
            return Ok(device);
        }
        warn!(
            "{} device not found: {}; falling back to the default",
            if input { "Input" } else { "Output" },
            name
        );
    }
    let device = if input {
        host.default_input_device()
    } else {
        host.default_output_device()
    };
    device.ok_or_else(|| {
        anyhow::anyhow!(
            "No default {} device",
            if input { "input" } else { "output" }
        )
    })
}

pub fn open_devices(
    host_id: HostId,
    input_device_name: Option<&String>,
    output_device_name: Option<&String>,
    requested_sample_rate: Option<u32>,
    requested_buffer_size: Option<u32>,
) -> Result<DeviceSetup> {
    let host = cpal::host_from_id(host_id)?;
    let input_device = find_device(&host, input_device_name, true)?;
    let output_device = find_device(&host, output_device_name, false)?;
    info!("Using input device: {}", input_device.name()?);
    info!("Using output device: {}", output_device.name()?);

    let default_input_config = input_device.default_input_config()?;
    let default_output_config = output_device.default_output_config()?;
    let sample_format = default_output_config.sample_format();
    let buffer_range = default_output_config.buffer_size().clone();

    let mut output_config: StreamConfig = default_output_config.into();
    if let Some(sr) = requested_sample_rate {
        let supported = output_device.supported_output_configs()?.any(|range| {
            range.channels() == output_config.channels
                && range.sample_format() == sample_format
                && (range.min_sample_rate().0..=range.max_sample_rate().0).contains(&sr)
        });
        if supported {
            output_config.sample_rate = cpal::SampleRate(sr);
        } else {
            warn!(
                "Sample rate {} Hz is not supported; using {} Hz",
                sr, output_config.sample_rate.0
            );
        }
    }
    if let Some(bs) = requested_buffer_size {
        match buffer_range {
            SupportedBufferSize::Range { min, max } if !(min..=max).contains(&bs) => {
                warn!(
                    "Buffer size {} is outside {}..={}; using the device default",
                    bs, min, max
                );
            }
            _ => output_config.buffer_size = BufferSize::Fixed(bs),
        }
    }

    // Both streams run at the output rate so one frame counter serves both.
    let mut input_config: StreamConfig = default_input_config.into();
    if input_config.sample_rate != output_config.sample_rate {
        warn!(
            "Input default rate {} Hz differs from output {} Hz; requesting {} Hz",
            input_config.sample_rate.0, output_config.sample_rate.0, output_config.sample_rate.0
        );
        input_config.sample_rate = output_config.sample_rate;
    }
    input_config.buffer_size = output_config.buffer_size;

    Ok(DeviceSetup {
        input_device,
        output_device,
        input_config,
        output_config,
        sample_format,
    })
}

pub fn init_and_run_streams(
    setup: &DeviceSetup,
    audio_input_producer: HeapProducer<f32>,
    engine: AudioEngine,
    xrun_count: Arc<AtomicUsize>,
) -> Result<(Stream, Stream)> {
    fn run<T>(
        setup: &DeviceSetup,
        audio_producer: HeapProducer<f32>,
        engine: AudioEngine,
        xrun_count: Arc<AtomicUsize>,
    ) -> Result<(Stream, Stream)>
    where
        T: Sample + cpal::SizedSample + FromSample<f32>,
        f32: FromSample<T>,
    {
        let input_latency_compensation_ms = engine.input_latency_compensation_ms.clone();
        let input_stream = build_input_stream::<T>(
            &setup.input_device,
            &setup.input_config,
            audio_producer,
            xrun_count.clone(),
        )?;
        let output_stream = build_output_stream::<T>(
            &setup.output_device,
            &setup.output_config,
            engine,
            xrun_count,
            input_latency_compensation_ms,
        )?;
        input_stream.play()?;
        output_stream.play()?;
        Ok((input_stream, output_stream))
    }

    let (input_stream, output_stream) = match setup.sample_format {
        SampleFormat::F32 => run::<f32>(setup, audio_input_producer, engine, xrun_count)?,
        SampleFormat::I16 => run::<i16>(setup, audio_input_producer, engine, xrun_count)?,
        SampleFormat::U16 => run::<u16>(setup, audio_input_producer, engine, xrun_count)?,
        format => return Err(anyhow::anyhow!("Unsupported sample format {}", format)),
    };

    info!(
        "Successfully started streams with Sample Rate: {} Hz, Buffer Size: {} Samples",
        setup.sample_rate(),
        setup.buffer_size()
    );

    Ok((input_stream, output_stream))
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: HeapProducer<f32>,
    xrun_count: Arc<AtomicUsize>,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample,
    f32: FromSample<T>,
{
    let err_fn = {
        let xrun_count_clone = xrun_count.clone();
        move |err| {
            error!("an error occurred on input stream: {}", err);
            xrun_count_clone.fetch_add(1, Ordering::Relaxed);
        }
    };

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            // Interleaved; the engine downmixes and captures per channel.
            for sample in data {
                if producer.push(f32::from_sample(*sample)).is_err() {
                    xrun_count.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut engine: AudioEngine,
    xrun_count: Arc<AtomicUsize>,
    input_latency_compensation_ms: Arc<AtomicU32>,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let sample_rate = config.sample_rate.0;
    let input_channels = engine.input_channels();
    let err_fn = {
        let xrun_count_clone = xrun_count.clone();
        move |err| {
            error!("an error occurred on output stream: {}", err);
            xrun_count_clone.fetch_add(1, Ordering::Relaxed);
        }
    };
    let mut input_buffer: Vec<f32> = vec![];
    let mut output_buffer: Vec<f32> = vec![];

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let num_frames = data.len() / channels;
            input_buffer.resize(num_frames * input_channels, 0.0);
            output_buffer.resize(num_frames * OUTPUT_CHANNELS, 0.0);

            let consumer = &mut engine.input_consumer;

            // --- Input latency manager ---
            // Keep at most the configured safety margin queued, in whole frames.
            let latency_ms = input_latency_compensation_ms.load(Ordering::Relaxed) as f32 / 100.0;
            let target_len =
                (latency_ms / 1000.0 * sample_rate as f32).round() as usize * input_channels;
            if consumer.len() > target_len {
                let excess = consumer.len() - target_len;
                consumer.skip(excess - excess % input_channels);
            }

            let samples_read = consumer.pop_slice(&mut input_buffer);
            if samples_read < input_buffer.len() {
                input_buffer[samples_read..].iter_mut().for_each(|s| *s = 0.0);
            }

            engine.process(&input_buffer, &mut output_buffer);

            for (frame, stereo) in data
                .chunks_mut(channels)
                .zip(output_buffer.chunks_exact(OUTPUT_CHANNELS))
            {
                if channels == 1 {
                    frame[0] = T::from_sample((stereo[0] + stereo[1]) * 0.5);
                    continue;
                }
                for (ch, sample) in frame.iter_mut().enumerate() {
                    let value = stereo.get(ch).copied().unwrap_or(0.0);
                    *sample = T::from_sample(value);
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}
