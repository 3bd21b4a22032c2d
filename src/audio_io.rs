// src/audio_io.rs

//! cpal stream construction. The capture and render callbacks only touch the
//! ring buffers and the cancellation token; everything else happens on the
//! processing thread.

use crate::engine::CancellationToken;
use crate::ring_buffer::RingBuffer;
use crate::settings::Config;
use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, Stream, StreamConfig};
use log::{error, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub fn init_and_run_streams(
    config: &Config,
    in_buf: Arc<RingBuffer>,
    out_buf: Arc<RingBuffer>,
    cancel: CancellationToken,
    xrun_count: Arc<AtomicUsize>,
) -> Result<(Stream, Stream)> {
    let host = cpal::default_host();
    let input_device = if let Some(name) = &config.input_device {
        host.input_devices()?
            .find(|d| d.name().ok().as_ref() == Some(name))
            .ok_or_else(|| anyhow::anyhow!("Input device not found: {}", name))?
    } else {
        host.default_input_device()
            .ok_or_else(|| anyhow::anyhow!("No default input device"))?
    };
    let output_device = if let Some(name) = &config.output_device {
        host.output_devices()?
            .find(|d| d.name().ok().as_ref() == Some(name))
            .ok_or_else(|| anyhow::anyhow!("Output device not found: {}", name))?
    } else {
        host.default_output_device()
            .ok_or_else(|| anyhow::anyhow!("No default output device"))?
    };
    info!("Using input device: {}", input_device.name()?);
    info!("Using output device: {}", output_device.name()?);

    let sample_format = output_device.default_output_config()?.sample_format();

    let input_config = StreamConfig {
        channels: config.channels_in as u16,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let output_config = StreamConfig {
        channels: config.channels_out as u16,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    fn run<T>(
        input_device: &Device,
        input_config: &StreamConfig,
        output_device: &Device,
        output_config: &StreamConfig,
        in_buf: Arc<RingBuffer>,
        out_buf: Arc<RingBuffer>,
        cancel: CancellationToken,
        xrun_count: Arc<AtomicUsize>,
    ) -> Result<(Stream, Stream)>
    where
        T: Sample + cpal::SizedSample + FromSample<f32>,
        f32: FromSample<T>,
    {
        let input_stream = build_input_stream::<T>(
            input_device,
            input_config,
            in_buf,
            cancel.clone(),
            xrun_count.clone(),
        )?;
        let output_stream =
            build_output_stream::<T>(output_device, output_config, out_buf, cancel, xrun_count)?;
        input_stream.play()?;
        output_stream.play()?;
        Ok((input_stream, output_stream))
    }

    let (input_stream, output_stream) = match sample_format {
        SampleFormat::F32 => run::<f32>(
            &input_device,
            &input_config,
            &output_device,
            &output_config,
            in_buf,
            out_buf,
            cancel,
            xrun_count,
        )?,
        SampleFormat::I16 => run::<i16>(
            &input_device,
            &input_config,
            &output_device,
            &output_config,
            in_buf,
            out_buf,
            cancel,
            xrun_count,
        )?,
        SampleFormat::U16 => run::<u16>(
            &input_device,
            &input_config,
            &output_device,
            &output_config,
            in_buf,
            out_buf,
            cancel,
            xrun_count,
        )?,
        format => return Err(anyhow::anyhow!("Unsupported sample format {}", format)),
    };

    info!(
        "Streams running at {} Hz, {} in / {} out channels",
        config.sample_rate, config.channels_in, config.channels_out
    );

    Ok((input_stream, output_stream))
}

fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    in_buf: Arc<RingBuffer>,
    cancel: CancellationToken,
    xrun_count: Arc<AtomicUsize>,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample,
    f32: FromSample<T>,
{
    let err_fn = {
        let xrun_count = xrun_count.clone();
        move |err| {
            error!("an error occurred on input stream: {}", err);
            xrun_count.fetch_add(1, Ordering::Relaxed);
        }
    };
    let mut convert_buf: Vec<f32> = Vec::new();

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if cancel.is_cancelled() {
                return;
            }
            convert_buf.resize(data.len(), 0.0);
            for (dst, src) in convert_buf.iter_mut().zip(data) {
                *dst = f32::from_sample(*src);
            }
            // Whatever does not fit is dropped here; the write itself never
            // blocks the audio thread.
            in_buf.write(&convert_buf);
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

fn build_output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    out_buf: Arc<RingBuffer>,
    cancel: CancellationToken,
    xrun_count: Arc<AtomicUsize>,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let err_fn = {
        let xrun_count = xrun_count.clone();
        move |err| {
            error!("an error occurred on output stream: {}", err);
            xrun_count.fetch_add(1, Ordering::Relaxed);
        }
    };
    let mut render_buf: Vec<f32> = Vec::new();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels;
            render_buf.resize(data.len(), 0.0);
            let filled = !cancel.is_cancelled()
                && out_buf.available_to_read() >= frames
                && out_buf.read_into(frames, &mut render_buf).is_ok();
            if filled {
                for (dst, src) in data.iter_mut().zip(&render_buf) {
                    *dst = T::from_sample(*src);
                }
            } else {
                // Not enough processed audio yet: emit silence, never stall
                // the audio subsystem.
                for dst in data.iter_mut() {
                    *dst = T::from_sample(0.0f32);
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}
