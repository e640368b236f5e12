//! # Shamir Secret Sharing
//!
//! Splits a secret into `parts` shares so that any `threshold` of them
//! rebuild it. Arithmetic is over GF(2^8) with the AES reduction polynomial
//! (x^8 + x^4 + x^3 + x + 1), one independent random polynomial per secret
//! byte.
//!
//! ## Share format
//!
//! ```text
//! [y-coordinate per secret byte ...][x-coordinate]
//! ```
//!
//! Share `i` (zero based) is evaluated at `x = i + 1`, so every share is one
//! byte longer than the secret.
//!
//! Combining fewer than `threshold` shares yields a wrong secret without any
//! error; callers must validate the result independently.

use crate::error::{Result, SopsError};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

pub const MAX_PARTS: usize = 255;

/// Split `secret` into `parts` shares with the given `threshold`.
pub fn split(secret: &[u8], parts: usize, threshold: usize) -> Result<Vec<Vec<u8>>> {
    if parts > MAX_PARTS {
        return Err(SopsError::Shamir(format!(
            "parts cannot exceed {MAX_PARTS}, got {parts}"
        )));
    }
    if threshold == 0 || threshold > parts {
        return Err(SopsError::Shamir(format!(
            "threshold must be between 1 and {parts}, got {threshold}"
        )));
    }
    if secret.is_empty() {
        return Err(SopsError::Shamir("cannot split an empty secret".into()));
    }

    let mut shares: Vec<Vec<u8>> = (0..parts)
        .map(|_| Vec::with_capacity(secret.len() + 1))
        .collect();

    let mut coefficients = vec![0u8; threshold];
    for &byte in secret {
        coefficients[0] = byte;
        OsRng.fill_bytes(&mut coefficients[1..]);
        for (i, share) in shares.iter_mut().enumerate() {
            share.push(evaluate(&coefficients, x_coordinate(i)));
        }
    }
    coefficients.zeroize();

    for (i, share) in shares.iter_mut().enumerate() {
        share.push(x_coordinate(i));
    }
    Ok(shares)
}

/// Rebuild a secret from shares produced by [`split`].
pub fn combine(shares: &[Vec<u8>]) -> Result<Vec<u8>> {
    let first = shares
        .first()
        .ok_or_else(|| SopsError::Shamir("at least one share is required".into()))?;
    let share_len = first.len();
    if share_len < 2 {
        return Err(SopsError::Shamir("shares must be at least two bytes long".into()));
    }
    if shares.iter().any(|s| s.len() != share_len) {
        return Err(SopsError::Shamir("all shares must be the same length".into()));
    }

    let xs: Vec<u8> = shares.iter().map(|s| s[share_len - 1]).collect();
    for (i, x) in xs.iter().enumerate() {
        if xs[..i].contains(x) {
            return Err(SopsError::Shamir(format!("duplicate share x-coordinate {x}")));
        }
    }

    let mut secret = Vec::with_capacity(share_len - 1);
    for byte in 0..share_len - 1 {
        let ys: Vec<u8> = shares.iter().map(|s| s[byte]).collect();
        secret.push(interpolate_at_zero(&xs, &ys));
    }
    Ok(secret)
}

fn x_coordinate(index: usize) -> u8 {
    (index + 1) as u8
}

/// Horner evaluation of the polynomial at `x`.
fn evaluate(coefficients: &[u8], x: u8) -> u8 {
    coefficients
        .iter()
        .rev()
        .fold(0u8, |acc, &c| add(mul(acc, x), c))
}

/// Lagrange interpolation of the polynomial through the points at x = 0.
fn interpolate_at_zero(xs: &[u8], ys: &[u8]) -> u8 {
    let mut result = 0u8;
    for (i, (&xi, &yi)) in xs.iter().zip(ys).enumerate() {
        let mut basis = 1u8;
        for (j, &xj) in xs.iter().enumerate() {
            if i != j {
                basis = mul(basis, div(xj, add(xj, xi)));
            }
        }
        result = add(result, mul(yi, basis));
    }
    result
}

fn add(a: u8, b: u8) -> u8 {
    a ^ b
}

/// Carry-less multiplication reduced by 0x11b, without data-dependent branches.
fn mul(a: u8, b: u8) -> u8 {
    let mut a = a;
    let mut b = b;
    let mut product = 0u8;
    for _ in 0..8 {
        product ^= a & 0u8.wrapping_sub(b & 1);
        let carry = 0u8.wrapping_sub(a >> 7);
        a = (a << 1) ^ (0x1b & carry);
        b >>= 1;
    }
    product
}

/// Multiplicative inverse via a^254.
fn inverse(a: u8) -> u8 {
    let mut result = 1u8;
    let mut base = a;
    let mut exponent = 254u8;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = mul(result, base);
        }
        base = mul(base, base);
        exponent >>= 1;
    }
    result
}

fn div(a: u8, b: u8) -> u8 {
    mul(a, inverse(b))
}
