// Display helpers: reduce full-rate cycle buffers to a few hundred points for plotting
use indexmap::IndexMap;
use ndarray::{Array1, ArrayView1};

use crate::error::CompileResult;
use crate::registry::PortRegistry;
use crate::timing::TimingConfig;

/// Min/max decimation that keeps narrow pulses visible.
///
/// The buffer is cut into `target / 2` buckets; each bucket contributes its minimum and maximum
/// in the order they occur. Buffers already no longer than `target` are returned unchanged.
///
/// ```
/// use ndarray::array;
/// use spimcompiler_backend::downsample_minmax;
///
/// let buf = array![0., 0., 0., 5., 0., 0., 0., 0.];
/// let small = downsample_minmax(buf.view(), 4);
/// assert_eq!(small.to_vec(), vec![0., 5., 0., 0.]);
/// ```
pub fn downsample_minmax(buffer: ArrayView1<f64>, target: usize) -> Array1<f64> {
    if buffer.len() <= target || target < 2 {
        return buffer.to_owned();
    }
    let n_buckets = target / 2;
    let len = buffer.len();
    let mut out = Vec::with_capacity(target);
    for b in 0..n_buckets {
        let lo = b * len / n_buckets;
        let hi = ((b + 1) * len / n_buckets).max(lo + 1);
        let bucket = buffer.slice(ndarray::s![lo..hi]);
        let (mut i_min, mut i_max) = (0, 0);
        for (i, &v) in bucket.iter().enumerate() {
            if v < bucket[i_min] {
                i_min = i;
            }
            if v > bucket[i_max] {
                i_max = i;
            }
        }
        if i_min <= i_max {
            out.push(bucket[i_min]);
            out.push(bucket[i_max]);
        } else {
            out.push(bucket[i_max]);
            out.push(bucket[i_min]);
        }
    }
    out.truncate(target);
    Array1::from_vec(out)
}

/// Per-port preview of one full cycle (rest interval included), downsampled to `target` points.
pub fn preview(
    registry: &PortRegistry,
    channel: &str,
    timing: &TimingConfig,
    target: usize,
) -> CompileResult<IndexMap<String, Array1<f64>>> {
    let matrix = registry.compile(channel, timing)?;
    Ok(registry
        .iter()
        .zip(matrix.rows())
        .map(|(port, row)| (port.name().to_string(), downsample_minmax(row, target)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    #[test]
    fn short_buffers_untouched() {
        let buf = Array1::linspace(0., 1., 10);
        assert_eq!(downsample_minmax(buf.view(), 10), buf);
        assert_eq!(downsample_minmax(buf.view(), 1), buf);
    }

    #[test]
    fn keeps_extremes() {
        let mut buf = Array1::zeros(1000);
        buf[501] = -3.;
        buf[777] = 4.;
        let small = downsample_minmax(buf.view(), 100);
        assert_eq!(small.len(), 100);
        assert!(small.iter().any(|&v| v == -3.));
        assert!(small.iter().any(|&v| v == 4.));
    }

    #[test]
    fn odd_target_truncated() {
        let buf = Array1::linspace(0., 1., 100);
        assert_eq!(downsample_minmax(buf.view(), 7).len(), 6);
    }
}
