//! The ShaderToy uniform interface and per-frame values.

use std::time::Instant;

use chrono::{Datelike, Local, Timelike};

use super::backend::{GpuBackend, ProgramHandle, UniformValue};

pub const DEFAULT_SAMPLE_RATE: f32 = 44_100.0;

/// `(name, declaration)` for every standard uniform, in declaration order.
pub const STANDARD_UNIFORMS: [(&str, &str); 12] = [
    ("iResolution", "uniform vec3 iResolution;"),
    ("iTime", "uniform float iTime;"),
    ("iTimeDelta", "uniform float iTimeDelta;"),
    ("iFrame", "uniform float iFrame;"),
    ("iMouse", "uniform vec4 iMouse;"),
    ("iDate", "uniform vec4 iDate;"),
    ("iSampleRate", "uniform float iSampleRate;"),
    ("iChannel0", "uniform sampler2D iChannel0;"),
    ("iChannel1", "uniform sampler2D iChannel1;"),
    ("iChannel2", "uniform sampler2D iChannel2;"),
    ("iChannel3", "uniform sampler2D iChannel3;"),
    ("iChannelResolution", "uniform vec3 iChannelResolution[4];"),
];

/// Sampler uniform names; channel `i` is bound to texture unit `i`.
pub const CHANNEL_UNIFORMS: [&str; 4] = ["iChannel0", "iChannel1", "iChannel2", "iChannel3"];

pub fn is_standard_uniform(name: &str) -> bool {
    STANDARD_UNIFORMS.iter().any(|(n, _)| *n == name)
}

/// Values shared by every node drawn in one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameUniforms {
    pub time: f32,
    pub time_delta: f32,
    pub frame: u32,
    pub mouse: [f32; 4],
    /// year, month (0-based), day of month, seconds since midnight
    pub date: [f32; 4],
    pub sample_rate: f32,
}

impl FrameUniforms {
    /// Set the frame-wide and per-node uniforms on `program`. Names the
    /// program does not declare are skipped by the backend.
    pub fn apply<B: GpuBackend + ?Sized>(
        &self,
        backend: &mut B,
        program: &ProgramHandle,
        resolution: [u32; 2],
    ) {
        let [w, h] = resolution;
        backend.set_uniform(program, "iTime", UniformValue::Float(self.time));
        backend.set_uniform(program, "iTimeDelta", UniformValue::Float(self.time_delta));
        backend.set_uniform(program, "iFrame", UniformValue::Float(self.frame as f32));
        backend.set_uniform(program, "iMouse", UniformValue::Vec4(self.mouse));
        backend.set_uniform(program, "iDate", UniformValue::Vec4(self.date));
        backend.set_uniform(program, "iSampleRate", UniformValue::Float(self.sample_rate));
        backend.set_uniform(
            program,
            "iResolution",
            UniformValue::Vec3([w as f32, h as f32, 1.0]),
        );
    }
}

/// Session clock: time since start, frame counter and the last mouse state.
#[derive(Debug, Clone)]
pub struct FrameClock {
    started: Instant,
    last_time: Option<f32>,
    frame: u32,
    mouse: [f32; 4],
    sample_rate: f32,
}

impl FrameClock {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            started: Instant::now(),
            last_time: None,
            frame: 0,
            mouse: [0.0; 4],
            sample_rate,
        }
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn set_mouse(&mut self, mouse: [f32; 4]) {
        self.mouse = mouse;
    }

    /// Advance using wall-clock time since the session started.
    pub fn tick(&mut self) -> FrameUniforms {
        let now = self.started.elapsed().as_secs_f32();
        self.at(now)
    }

    /// Advance to an explicit time in seconds.
    pub fn at(&mut self, time: f32) -> FrameUniforms {
        let time_delta = self.last_time.map_or(0.0, |last| (time - last).max(0.0));
        self.last_time = Some(time);
        let uniforms = FrameUniforms {
            time,
            time_delta,
            frame: self.frame,
            mouse: self.mouse,
            date: current_date(),
            sample_rate: self.sample_rate,
        };
        self.frame = self.frame.wrapping_add(1);
        uniforms
    }
}

fn current_date() -> [f32; 4] {
    let now = Local::now();
    let seconds = now.num_seconds_from_midnight() as f32 + now.nanosecond() as f32 / 1e9;
    [now.year() as f32, now.month0() as f32, now.day() as f32, seconds]
}
