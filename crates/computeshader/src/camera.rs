//! Orbit camera published as shader parameters.
//!
//! The camera circles `target` on a sphere given by latitude, longitude and
//! distance. Every change is written into the [`ParameterStore`] as
//! `CameraPosition`, `InvProjection` and `InvView`, which ray-marching
//! shaders use to turn a pixel into a world-space ray.

use glam::{Mat4, Vec3};
use renderer::{InputEvent, ParamValue, ParameterError, ParameterStore};
use sceneconfig::{CameraConfig, MAX_LATITUDE};

#[derive(Debug, Clone, PartialEq)]
pub struct OrbitCamera {
    config: CameraConfig,
    latitude: f32,
    longitude: f32,
    distance: f32,
    aspect: f32,
    /// Whether the image being rendered follows the window size.
    tracks_surface: bool,
}

impl OrbitCamera {
    pub fn new(config: CameraConfig, viewport: (u32, u32), tracks_surface: bool) -> Self {
        Self {
            latitude: config.latitude.clamp(-MAX_LATITUDE, MAX_LATITUDE),
            longitude: config.longitude.rem_euclid(360.0),
            distance: config.distance.clamp(config.min_distance, config.max_distance),
            aspect: aspect(viewport),
            tracks_surface,
            config,
        }
    }

    pub fn latitude(&self) -> f32 {
        self.latitude
    }

    pub fn longitude(&self) -> f32 {
        self.longitude
    }

    pub fn distance(&self) -> f32 {
        self.distance
    }

    pub fn position(&self) -> Vec3 {
        let (latitude, longitude) = (self.latitude.to_radians(), self.longitude.to_radians());
        let direction = Vec3::new(
            latitude.cos() * longitude.sin(),
            latitude.sin(),
            latitude.cos() * longitude.cos(),
        );
        Vec3::from(self.config.target) + direction * self.distance
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position(), Vec3::from(self.config.target), Vec3::Y)
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(
            self.config.fov_degrees.to_radians(),
            self.aspect,
            self.config.near,
            self.config.far,
        )
    }

    /// Updates the camera; returns whether anything changed.
    pub fn apply(&mut self, event: &InputEvent) -> bool {
        let before = (self.latitude, self.longitude, self.distance, self.aspect);
        match *event {
            InputEvent::Drag { dx, dy } => {
                let turn = self.config.sensitivity;
                self.longitude = (self.longitude - dx * turn).rem_euclid(360.0);
                self.latitude = (self.latitude + dy * turn).clamp(-MAX_LATITUDE, MAX_LATITUDE);
            }
            InputEvent::Scroll { lines } => {
                self.distance = (self.distance - lines * self.config.zoom_step)
                    .clamp(self.config.min_distance, self.config.max_distance);
            }
            InputEvent::Resized { width, height } => {
                if self.tracks_surface && width > 0 && height > 0 {
                    self.aspect = aspect((width, height));
                }
            }
        }
        before != (self.latitude, self.longitude, self.distance, self.aspect)
    }

    pub fn parameters(&self) -> [(&'static str, ParamValue); 3] {
        [
            ("CameraPosition", ParamValue::Vec3(self.position().to_array())),
            (
                "InvProjection",
                ParamValue::Mat4(self.projection().inverse().to_cols_array_2d()),
            ),
            (
                "InvView",
                ParamValue::Mat4(self.view().inverse().to_cols_array_2d()),
            ),
        ]
    }

    pub fn publish(&self, store: &ParameterStore) -> Result<(), ParameterError> {
        for (name, value) in self.parameters() {
            store.set(name, value)?;
        }
        Ok(())
    }
}

fn aspect((width, height): (u32, u32)) -> f32 {
    width.max(1) as f32 / height.max(1) as f32
}
