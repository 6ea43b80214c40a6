//! Exact rational numbers for symbolic exponents and coefficients.
//!
//! Every `Rational` is kept reduced with a positive denominator, so structural
//! equality coincides with numeric equality. Arithmetic is checked: operations
//! that would overflow `i64` return `None` instead of wrapping.

use num_integer::Integer;
use std::cmp::Ordering;
use std::fmt;

/// Reduced fraction `num / den` with `den > 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rational {
    num: i64,
    den: i64,
}

impl Rational {
    pub const ZERO: Rational = Rational { num: 0, den: 1 };
    pub const ONE: Rational = Rational { num: 1, den: 1 };
    pub const HALF: Rational = Rational { num: 1, den: 2 };

    /// Build a reduced fraction. Returns `None` for a zero denominator.
    pub fn new(num: i64, den: i64) -> Option<Self> {
        if den == 0 {
            return None;
        }
        Self::reduce(num as i128, den as i128)
    }

    pub fn from_integer(value: i64) -> Self {
        Rational { num: value, den: 1 }
    }

    pub fn numer(&self) -> i64 {
        self.num
    }

    pub fn denom(&self) -> i64 {
        self.den
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    pub fn is_one(&self) -> bool {
        self.num == 1 && self.den == 1
    }

    pub fn is_integer(&self) -> bool {
        self.den == 1
    }

    pub fn is_negative(&self) -> bool {
        self.num < 0
    }

    /// The integer value, if the fraction is integral.
    pub fn to_integer(&self) -> Option<i64> {
        if self.den == 1 {
            Some(self.num)
        } else {
            None
        }
    }

    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    pub fn abs(&self) -> Self {
        Rational {
            num: self.num.abs(),
            den: self.den,
        }
    }

    pub fn checked_neg(&self) -> Option<Self> {
        Some(Rational {
            num: self.num.checked_neg()?,
            den: self.den,
        })
    }

    pub fn checked_add(&self, other: &Self) -> Option<Self> {
        let num = self.num as i128 * other.den as i128 + other.num as i128 * self.den as i128;
        let den = self.den as i128 * other.den as i128;
        Self::reduce(num, den)
    }

    pub fn checked_sub(&self, other: &Self) -> Option<Self> {
        self.checked_add(&other.checked_neg()?)
    }

    pub fn checked_mul(&self, other: &Self) -> Option<Self> {
        let num = self.num as i128 * other.num as i128;
        let den = self.den as i128 * other.den as i128;
        Self::reduce(num, den)
    }

    pub fn checked_div(&self, other: &Self) -> Option<Self> {
        self.checked_mul(&other.recip()?)
    }

    /// Multiplicative inverse; `None` for zero.
    pub fn recip(&self) -> Option<Self> {
        if self.num == 0 {
            return None;
        }
        Self::reduce(self.den as i128, self.num as i128)
    }

    /// Integer power, negative exponents invert. `None` on overflow or `0^-k`.
    pub fn checked_pow(&self, exp: i64) -> Option<Self> {
        let base = if exp < 0 { self.recip()? } else { *self };
        let mut remaining = exp.unsigned_abs();
        let mut acc = Rational::ONE;
        let mut square = base;
        while remaining > 0 {
            if remaining & 1 == 1 {
                acc = acc.checked_mul(&square)?;
            }
            remaining >>= 1;
            if remaining > 0 {
                square = square.checked_mul(&square)?;
            }
        }
        Some(acc)
    }

    /// Exact rational power. Succeeds only when the result is rational,
    /// i.e. when numerator and denominator are perfect `den`-th powers.
    pub fn exact_pow(&self, exp: &Rational) -> Option<Self> {
        if exp.den == 1 {
            return self.checked_pow(exp.num);
        }
        if self.num < 0 {
            return None;
        }
        let root_num = exact_root(self.num as u64, exp.den as u32)?;
        let root_den = exact_root(self.den as u64, exp.den as u32)?;
        Rational::new(root_num as i64, root_den as i64)?.checked_pow(exp.num)
    }

    /// Quotient of two integers truncated toward zero.
    pub fn trunc_div(a: i64, b: i64) -> Option<i64> {
        a.checked_div(b)
    }

    /// Remainder matching [`Rational::trunc_div`].
    pub fn trunc_rem(a: i64, b: i64) -> Option<i64> {
        a.checked_rem(b)
    }

    fn reduce(num: i128, den: i128) -> Option<Self> {
        if den == 0 {
            return None;
        }
        let g = num.gcd(&den);
        let (mut num, mut den) = if g == 0 { (0, 1) } else { (num / g, den / g) };
        if den < 0 {
            num = -num;
            den = -den;
        }
        Some(Rational {
            num: i64::try_from(num).ok()?,
            den: i64::try_from(den).ok()?,
        })
    }
}

/// Integer `n`-th root of `value` when it is exact.
fn exact_root(value: u64, n: u32) -> Option<u64> {
    if value < 2 || n == 1 {
        return Some(value);
    }
    let guess = (value as f64).powf(1.0 / n as f64).round() as u64;
    for candidate in guess.saturating_sub(1)..=guess + 1 {
        if candidate.checked_pow(n) == Some(value) {
            return Some(candidate);
        }
    }
    None
}

impl Default for Rational {
    fn default() -> Self {
        Rational::ZERO
    }
}

impl From<i64> for Rational {
    fn from(value: i64) -> Self {
        Rational::from_integer(value)
    }
}

impl PartialOrd for Rational {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rational {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.num as i128 * other.den as i128;
        let rhs = other.num as i128 * self.den as i128;
        lhs.cmp(&rhs)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}
