// SPDX-License-Identifier: GPL-3.0-only

//! GStreamer graph behind the libcamera device
//!
//! ```text
//! libcamerasrc ! I420 ! [videoflip] ! tee
//!   ├─ queue ! videoscale ! appsink "lores"      (preview / motion)
//!   ├─ queue ! appsink "hires"                   (stills)
//!   └─ queue ! valve ! v4l2h264enc ! appsink     (pre-roll ring)
//! ```
//!
//! The valve is closed until the pre-roll encoder is started. Encoded buffers
//! are pushed straight into the shared [`CircularOutput`] from the appsink
//! callback.

use crate::backends::camera::types::*;
use crate::constants::video::KEYFRAME_INTERVAL;
use crate::errors::{CaptureError, HalError, HalResult};
use crate::pipelines::video::{CircularOutput, EncodedFrame};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::AppSink;
use gstreamer_video::VideoInfo;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long a frame pull may block before it counts as dropped
const PULL_TIMEOUT: Duration = Duration::from_secs(2);

pub type SharedOutput = Arc<Mutex<Option<CircularOutput>>>;
pub type SharedHook = Arc<Mutex<Option<PreprocessHook>>>;

/// Running camera graph
pub struct StreamGraph {
    pipeline: gst::Pipeline,
    source: gst::Element,
    lores: AppSink,
    hires: AppSink,
    valve: gst::Element,
}

impl StreamGraph {
    /// Build and start the graph for `configuration`
    pub fn start(
        configuration: &CameraConfiguration,
        camera_name: Option<&str>,
        output: SharedOutput,
        hook: SharedHook,
    ) -> HalResult<Self> {
        gst::init().map_err(|e| HalError::DeviceUnavailable(format!("GStreamer init failed: {}", e)))?;

        let (width, height) = configuration.resolution.dimensions();
        let (lores_w, lores_h) = configuration.resolution.lores_dimensions();
        let camera = camera_name
            .map(|name| format!(" camera-name=\"{}\"", name))
            .unwrap_or_default();
        let flip = if configuration.rotate {
            "videoflip method=rotate-180 ! "
        } else {
            ""
        };

        let pipeline_str = format!(
            "libcamerasrc name=src{camera} ! \
             video/x-raw,format=I420,width={width},height={height},framerate={fps}/1 ! \
             {flip}tee name=t \
             t. ! queue leaky=downstream max-size-buffers=2 ! videoscale ! \
                  video/x-raw,width={lores_w},height={lores_h} ! \
                  appsink name=lores max-buffers=1 drop=true sync=false \
             t. ! queue leaky=downstream max-size-buffers=2 ! \
                  appsink name=hires max-buffers=1 drop=true sync=false \
             t. ! queue ! valve name=encvalve drop=true ! \
                  v4l2h264enc extra-controls=\"controls,video_gop_size={gop},repeat_sequence_header=1\" ! \
                  video/x-h264,stream-format=byte-stream,alignment=au ! \
                  appsink name=encoded sync=false",
            fps = configuration.frame_rate,
            gop = KEYFRAME_INTERVAL,
        );
        debug!(pipeline = %pipeline_str, "Creating camera pipeline");

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| HalError::DeviceUnavailable(format!("Failed to create pipeline: {}", e)))?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| HalError::DeviceUnavailable("Failed to cast to Pipeline".into()))?;

        let source = element(&pipeline, "src")?;
        let valve = element(&pipeline, "encvalve")?;
        let lores = appsink(&pipeline, "lores")?;
        let hires = appsink(&pipeline, "hires")?;
        let encoded = appsink(&pipeline, "encoded")?;

        install_hook_probe(&valve, width, height, hook)?;
        install_encoded_callback(&encoded, output);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| HalError::DeviceUnavailable(format!("Failed to start pipeline: {:?}", e)))?;
        let (result, _, _) = pipeline.state(gst::ClockTime::from_seconds(5));
        result.map_err(|e| HalError::DeviceUnavailable(format!("Camera did not start: {:?}", e)))?;

        info!(width, height, lores_w, lores_h, "Camera pipeline running");
        Ok(Self {
            pipeline,
            source,
            lores,
            hires,
            valve,
        })
    }

    /// Wait for the next frame of `tier`
    pub fn pull(&self, tier: ResolutionTier) -> HalResult<Frame> {
        let sink = match tier {
            ResolutionTier::Low => &self.lores,
            ResolutionTier::High => &self.hires,
        };
        let sample = sink
            .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64))
            .ok_or_else(|| CaptureError::FrameDropped(format!("no {} frame within {:?}", tier, PULL_TIMEOUT)))?;
        frame_from_sample(&sample, tier)
            .ok_or_else(|| CaptureError::FrameDropped(format!("unreadable {} sample", tier)).into())
    }

    /// Open or close the encoder branch
    pub fn set_encoding(&self, enabled: bool) {
        self.valve.set_property("drop", !enabled);
    }

    /// Set a `libcamerasrc` control if this build of the element has it
    pub fn set_control(&self, name: &'static str, value: &str) -> HalResult<()> {
        if self.source.find_property(name).is_none() {
            return Err(HalError::Unsupported(name));
        }
        self.source
            .try_set_property_from_str(name, value)
            .map_err(|e| HalError::DeviceUnavailable(format!("{} = {}: {}", name, value, e)))
    }

    /// Current value of a `libcamerasrc` control in GStreamer's string form
    pub fn property_string(&self, name: &str) -> Option<String> {
        self.source.find_property(name)?;
        self.source
            .property_value(name)
            .serialize()
            .ok()
            .map(|s| s.to_string())
    }

    pub fn has_control(&self, name: &str) -> bool {
        self.source.find_property(name).is_some()
    }

    pub fn stop(self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(error = ?e, "Failed to stop camera pipeline");
        }
    }
}

fn element(pipeline: &gst::Pipeline, name: &str) -> HalResult<gst::Element> {
    pipeline
        .by_name(name)
        .ok_or_else(|| HalError::DeviceUnavailable(format!("pipeline has no '{}'", name)))
}

fn appsink(pipeline: &gst::Pipeline, name: &str) -> HalResult<AppSink> {
    element(pipeline, name)?
        .dynamic_cast::<AppSink>()
        .map_err(|_| HalError::DeviceUnavailable(format!("'{}' is not an appsink", name)))
}

/// Copy an I420 sample into a tightly packed [`Frame`]
fn frame_from_sample(sample: &gst::Sample, tier: ResolutionTier) -> Option<Frame> {
    let info = VideoInfo::from_caps(sample.caps()?).ok()?;
    let buffer = sample.buffer()?;
    let map = buffer.map_readable().ok()?;
    let (width, height) = (info.width(), info.height());
    let (chroma_w, chroma_h) = chroma_dimensions(width, height);

    let mut data = Vec::with_capacity(Frame::i420_len(width, height));
    let planes = [(width, height), (chroma_w, chroma_h), (chroma_w, chroma_h)];
    for (plane, (plane_w, plane_h)) in planes.iter().enumerate() {
        let stride = info.stride()[plane] as usize;
        let offset = info.offset()[plane];
        for row in 0..*plane_h as usize {
            let start = offset + row * stride;
            data.extend_from_slice(map.as_slice().get(start..start + *plane_w as usize)?);
        }
    }

    Some(Frame {
        data,
        width,
        height,
        tier,
        pts: buffer
            .pts()
            .map_or(Duration::ZERO, |pts| Duration::from_nanos(pts.nseconds())),
    })
}

/// Run the preprocess hook on every frame entering the encoder
fn install_hook_probe(valve: &gst::Element, width: u32, height: u32, hook: SharedHook) -> HalResult<()> {
    let pad = valve
        .static_pad("src")
        .ok_or_else(|| HalError::DeviceUnavailable("valve has no src pad".into()))?;
    let expected = Frame::i420_len(width, height);

    pad.add_probe(gst::PadProbeType::BUFFER, move |_, info| {
        let Some(hook) = hook.lock().unwrap().clone() else {
            return gst::PadProbeReturn::Ok;
        };
        if let Some(gst::PadProbeData::Buffer(buffer)) = info.data.as_mut() {
            let pts = buffer
                .pts()
                .map_or(Duration::ZERO, |pts| Duration::from_nanos(pts.nseconds()));
            let buffer = buffer.make_mut();
            if let Ok(mut map) = buffer.map_writable()
                && map.len() == expected
            {
                let mut frame = Frame {
                    data: map.as_slice().to_vec(),
                    width,
                    height,
                    tier: ResolutionTier::High,
                    pts,
                };
                hook(&mut frame);
                map.as_mut_slice().copy_from_slice(&frame.data);
            }
        }
        gst::PadProbeReturn::Ok
    });
    Ok(())
}

/// Push encoded access units into the ring
fn install_encoded_callback(sink: &AppSink, output: SharedOutput) {
    sink.set_callbacks(
        gstreamer_app::AppSinkCallbacks::builder()
            .new_sample(move |appsink| {
                let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                let frame = EncodedFrame {
                    pts: buffer
                        .pts()
                        .map_or(Duration::ZERO, |pts| Duration::from_nanos(pts.nseconds())),
                    keyframe: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
                    data: Arc::from(map.as_slice()),
                };

                if let Some(output) = output.lock().unwrap().as_mut()
                    && let Err(e) = output.push(frame)
                {
                    error!(error = %e, "Failed to write encoded frame");
                }
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );
}
