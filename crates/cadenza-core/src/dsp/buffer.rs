//! Sample-buffer helpers used on the RT path.

/// Add `src` into `dst` sample-by-sample.
///
/// This is how a finished branch mixes into the master output buffer.
#[inline]
pub fn sum_into(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d += s;
    }
}

/// Multiply every sample in `buf` by `gain` in place.
#[inline]
pub fn scale(buf: &mut [f32], gain: f32) {
    for s in buf.iter_mut() {
        *s *= gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_and_scale() {
        let mut dst = [1.0, 2.0, 3.0, 4.0];
        sum_into(&mut dst, &[0.5, 0.5, 0.5, 0.5]);
        assert_eq!(dst, [1.5, 2.5, 3.5, 4.5]);

        scale(&mut dst, 2.0);
        assert_eq!(dst, [3.0, 5.0, 7.0, 9.0]);
    }
}
