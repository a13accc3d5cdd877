//! Thermal diffusion over a chip grid, ping-ponging between two
//! temperature buffers for a fixed number of iterations.

use offload::{
    BufferSet, Error, Hooks, HostLaunch, IterationState, KernelDescriptor, KernelRegistry, ScalarSet, ScalarValue,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DESCRIPTOR_BINARY: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/hotspot.bin"));

pub const ITERATIONS: u64 = 100;
const DEFAULT_SEED: u64 = 0x407_5907;

// chip parameters
const MAX_PD: f64 = 3.0e6;
const PRECISION: f64 = 0.001;
const SPEC_HEAT_SI: f64 = 1.75e6;
const K_SI: f64 = 100.0;
const FACTOR_CHIP: f64 = 0.5;
const T_CHIP: f64 = 0.0005;
const CHIP_HEIGHT: f64 = 0.016;
const CHIP_WIDTH: f64 = 0.016;

pub fn descriptor() -> offload::Result<KernelDescriptor> {
    bincode::deserialize(DESCRIPTOR_BINARY)
        .map_err(|e| Error::InvalidConfig(format!("embedded hotspot descriptor: {e}")))
}

/// Stencil coefficients for one grid size.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Coefficients {
    pub step_div_cap: f32,
    pub rx_inv: f32,
    pub ry_inv: f32,
    pub rz_inv: f32,
    pub amb_temp: f32,
}

impl Coefficients {
    pub fn for_grid(rows: usize, cols: usize, amb_temp: f32) -> Self {
        let grid_height = CHIP_HEIGHT / rows as f64;
        let grid_width = CHIP_WIDTH / cols as f64;

        let cap = FACTOR_CHIP * SPEC_HEAT_SI * T_CHIP * grid_width * grid_height;
        let rx = grid_width / (2.0 * K_SI * T_CHIP * grid_height);
        let ry = grid_height / (2.0 * K_SI * T_CHIP * grid_width);
        let rz = T_CHIP / (K_SI * grid_height * grid_width);

        let max_slope = MAX_PD / (FACTOR_CHIP * T_CHIP * SPEC_HEAT_SI);
        let step = PRECISION / max_slope;

        Self {
            step_div_cap: (step / cap) as f32,
            rx_inv: (1.0 / rx) as f32,
            ry_inv: (1.0 / ry) as f32,
            rz_inv: (1.0 / rz) as f32,
            amb_temp,
        }
    }

    fn store(&self, scalars: &mut ScalarSet) -> offload::Result<()> {
        scalars.set("step_div_cap", ScalarValue::F32(self.step_div_cap))?;
        scalars.set("rx_inv", ScalarValue::F32(self.rx_inv))?;
        scalars.set("ry_inv", ScalarValue::F32(self.ry_inv))?;
        scalars.set("rz_inv", ScalarValue::F32(self.rz_inv))?;
        scalars.set("amb_temp", ScalarValue::F32(self.amb_temp))
    }
}

/// Row-major grid dimensions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Grid {
    pub rows: usize,
    pub cols: usize,
}

impl Grid {
    /// Next temperature of cell `(r, c)`; edge cells reuse their own value
    /// for the missing neighbour.
    pub fn step_cell(&self, temp: &[f32], power: &[f32], k: &Coefficients, r: usize, c: usize) -> f32 {
        let at = |r: usize, c: usize| temp[r * self.cols + c];
        let t = at(r, c);
        let n = at(r.saturating_sub(1), c);
        let s = at((r + 1).min(self.rows - 1), c);
        let w = at(r, c.saturating_sub(1));
        let e = at(r, (c + 1).min(self.cols - 1));
        t + k.step_div_cap
            * (power[r * self.cols + c]
                + (s + n - 2.0 * t) * k.ry_inv
                + (e + w - 2.0 * t) * k.rx_inv
                + (k.amb_temp - t) * k.rz_inv)
    }

    pub fn step(&self, src: &[f32], dst: &mut [f32], power: &[f32], k: &Coefficients) {
        for r in 0..self.rows {
            for c in 0..self.cols {
                dst[r * self.cols + c] = self.step_cell(src, power, k, r, c);
            }
        }
    }

    /// Temperatures after `iterations` steps from `temp`.
    pub fn simulate(&self, temp: &[f32], power: &[f32], k: &Coefficients, iterations: u64) -> Vec<f32> {
        let mut src = temp.to_vec();
        let mut dst = vec![0.0f32; src.len()];
        for _ in 0..iterations {
            self.step(&src, &mut dst, power, k);
            std::mem::swap(&mut src, &mut dst);
        }
        src
    }
}

fn hotspot_kernel(launch: &HostLaunch<'_>) -> offload::Result<()> {
    let power = launch.buffer::<f32>(0)?;
    let src = launch.buffer::<f32>(1)?;
    let mut dst = launch.buffer::<f32>(2)?;
    let grid = Grid {
        rows: launch.u32(3)? as usize,
        cols: launch.u32(4)? as usize,
    };
    let k = Coefficients {
        step_div_cap: launch.f32(5)?,
        rx_inv: launch.f32(6)?,
        ry_inv: launch.f32(7)?,
        rz_inv: launch.f32(8)?,
        amb_temp: launch.f32(9)?,
    };
    let global = launch.global();
    for r in 0..grid.rows.min(global[1]) {
        for c in 0..grid.cols.min(global[0]) {
            dst[r * grid.cols + c] = grid.step_cell(&src, &power, &k, r, c);
        }
    }
    Ok(())
}

pub fn host_kernels() -> KernelRegistry {
    KernelRegistry::new().with("hotspot", hotspot_kernel)
}

/// Seeds power and temperature, then swaps `temp_src`/`temp_dst` after
/// every iteration until `iterations` have run.
pub struct HotspotHooks {
    iterations: u64,
    rng: StdRng,
    initial: Option<Vec<f32>>,
}

impl HotspotHooks {
    pub fn new(iterations: u64) -> Self {
        Self::seeded(iterations, DEFAULT_SEED)
    }

    pub fn seeded(iterations: u64, seed: u64) -> Self {
        Self {
            iterations: iterations.max(1),
            rng: StdRng::seed_from_u64(seed),
            initial: None,
        }
    }

    /// Start from `temp` instead of a random temperature field.
    pub fn with_initial(mut self, temp: Vec<f32>) -> Self {
        self.initial = Some(temp);
        self
    }
}

impl Default for HotspotHooks {
    fn default() -> Self {
        Self::new(ITERATIONS)
    }
}

fn setup_error(reason: String) -> Error {
    Error::Hook { stage: "setup", reason }
}

impl Hooks for HotspotHooks {
    fn setup(&mut self, buffers: &mut BufferSet, scalars: &mut ScalarSet) -> offload::Result<()> {
        let grid = Grid {
            rows: scalars.u32("rows")? as usize,
            cols: scalars.u32("cols")? as usize,
        };
        let cells = grid.rows * grid.cols;
        if buffers.get("temp_src")?.spec().len != cells {
            return Err(setup_error(format!(
                "grid {}x{} does not match buffer length {}",
                grid.rows,
                grid.cols,
                buffers.get("temp_src")?.spec().len
            )));
        }
        let k = Coefficients::for_grid(grid.rows, grid.cols, scalars.f32("amb_temp")?);
        k.store(scalars)?;

        for p in buffers.f32_mut("power")? {
            *p = self.rng.gen_range(0.0..1.0);
        }
        let temp = match self.initial.take() {
            Some(t) if t.len() == cells => t,
            Some(t) => {
                return Err(setup_error(format!(
                    "initial temperature has {} cells, grid has {cells}",
                    t.len()
                )))
            }
            None => (0..cells).map(|_| self.rng.gen_range(320.0..340.0)).collect(),
        };
        buffers.f32_mut("temp_src")?.copy_from_slice(&temp);

        let expected = grid.simulate(&temp, buffers.f32("power")?, &k, self.iterations);
        buffers.reference_mut::<f32>("temp_src")?.copy_from_slice(&expected);
        Ok(())
    }

    fn post_iteration(
        &mut self,
        state: &IterationState,
        buffers: &mut BufferSet,
        _scalars: &mut ScalarSet,
    ) -> offload::Result<bool> {
        buffers.swap("temp_src", "temp_dst")?;
        Ok(state.iteration + 1 < self.iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_field_at_ambient_without_power_is_stable() {
        let grid = Grid { rows: 4, cols: 5 };
        let k = Coefficients::for_grid(4, 5, 80.0);
        let temp = vec![80.0f32; 20];
        let power = vec![0.0f32; 20];
        assert_eq!(grid.simulate(&temp, &power, &k, 10), temp);
    }

    #[test]
    fn test_coefficients_for_default_grid() {
        let k = Coefficients::for_grid(64, 64, 80.0);
        assert!((k.rx_inv - 0.1).abs() < 1e-6);
        assert!((k.ry_inv - 0.1).abs() < 1e-6);
        assert!((k.rz_inv - 0.0125).abs() < 1e-6);
        assert!(k.step_div_cap > 0.0 && k.step_div_cap < 0.01);
    }
}
