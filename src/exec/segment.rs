//! Execution segments: how one instance's slice of a globally planned run is
//! described, and how VU identifiers are pre-sharded across instances so they
//! never collide without coordination.
//!
//! A segment is a fractional span of `[0, 1]`; a sequence partitions `[0, 1]`
//! into the segments of all participating instances. The partition is striped
//! at the granularity of the sequence's least common denominator, and each
//! instance walks only its own stripes when allocating global IDs or scaling
//! global counts down to local ones.

use super::ExecError;

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

/// Exact non-negative rational in `[0, 1]`, kept normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    num: u64,
    den: u64,
}

impl Fraction {
    pub fn new(num: u64, den: u64) -> Result<Self, ExecError> {
        if den == 0 {
            return Err(ExecError::Config("fraction denominator is zero".into()));
        }
        if num > den {
            return Err(ExecError::Config(format!(
                "fraction {num}/{den} is larger than 1"
            )));
        }
        let g = gcd(num, den).max(1);
        Ok(Self {
            num: num / g,
            den: den / g,
        })
    }

    pub const ZERO: Fraction = Fraction { num: 0, den: 1 };
    pub const ONE: Fraction = Fraction { num: 1, den: 1 };

    pub fn num(&self) -> u64 {
        self.num
    }

    pub fn den(&self) -> u64 {
        self.den
    }

    /// Accepts `"1/4"`, decimals like `"0.25"`, and plain `"0"` / `"1"`.
    pub fn parse(s: &str) -> Result<Self, ExecError> {
        let s = s.trim();
        if let Some((num, den)) = s.split_once('/') {
            let num: u64 = num
                .trim()
                .parse()
                .map_err(|_| ExecError::Config(format!("invalid fraction {s:?}")))?;
            let den: u64 = den
                .trim()
                .parse()
                .map_err(|_| ExecError::Config(format!("invalid fraction {s:?}")))?;
            return Self::new(num, den);
        }
        if let Some((whole, decimals)) = s.split_once('.') {
            if decimals.is_empty() || decimals.len() > 15 || decimals.bytes().any(|b| !b.is_ascii_digit()) {
                return Err(ExecError::Config(format!("invalid fraction {s:?}")));
            }
            let whole: u64 = if whole.is_empty() {
                0
            } else {
                whole
                    .parse()
                    .map_err(|_| ExecError::Config(format!("invalid fraction {s:?}")))?
            };
            let den = 10u64.pow(decimals.len() as u32);
            let frac: u64 = decimals.parse().expect("digits checked above");
            return Self::new(whole * den + frac, den);
        }
        let whole: u64 = s
            .parse()
            .map_err(|_| ExecError::Config(format!("invalid fraction {s:?}")))?;
        Self::new(whole, 1)
    }

    fn cmp_key(&self, other: &Fraction) -> std::cmp::Ordering {
        let lhs = self.num as u128 * other.den as u128;
        let rhs = other.num as u128 * self.den as u128;
        lhs.cmp(&rhs)
    }

    /// `self - other`; callers guarantee `self >= other`.
    fn sub(&self, other: &Fraction) -> Fraction {
        let den = lcm(self.den, other.den);
        let num = self.num * (den / self.den) - other.num * (den / other.den);
        let g = gcd(num, den).max(1);
        Fraction {
            num: num / g,
            den: den / g,
        }
    }
}

impl PartialOrd for Fraction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp_key(other))
    }
}

impl std::fmt::Display for Fraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

/// One instance's fractional span of the global plan, `from < to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSegment {
    from: Fraction,
    to: Fraction,
}

impl ExecutionSegment {
    pub fn new(from: Fraction, to: Fraction) -> Result<Self, ExecError> {
        if from >= to {
            return Err(ExecError::Config(format!(
                "execution segment {from}:{to} is empty or inverted"
            )));
        }
        Ok(Self { from, to })
    }

    /// The whole plan, `0:1`.
    pub fn full() -> Self {
        Self {
            from: Fraction::ZERO,
            to: Fraction::ONE,
        }
    }

    /// Accepts `"from:to"` (`"1/4:1/2"`, `"0:0.25"`) or a bare `"to"` meaning
    /// `0:to`.
    pub fn parse(s: &str) -> Result<Self, ExecError> {
        match s.split_once(':') {
            Some((from, to)) => Self::new(Fraction::parse(from)?, Fraction::parse(to)?),
            None => Self::new(Fraction::ZERO, Fraction::parse(s)?),
        }
    }

    pub fn from(&self) -> Fraction {
        self.from
    }

    pub fn to(&self) -> Fraction {
        self.to
    }

    pub fn length(&self) -> Fraction {
        self.to.sub(&self.from)
    }
}

impl std::fmt::Display for ExecutionSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.from, self.to)
    }
}

/// Ordered, contiguous partition of `[0, 1]` into segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSegmentSequence(Vec<ExecutionSegment>);

impl ExecutionSegmentSequence {
    pub fn new(segments: Vec<ExecutionSegment>) -> Result<Self, ExecError> {
        if segments.is_empty() {
            return Err(ExecError::Config("empty execution segment sequence".into()));
        }
        if segments[0].from() != Fraction::ZERO {
            return Err(ExecError::Config(
                "execution segment sequence must start at 0".into(),
            ));
        }
        for pair in segments.windows(2) {
            if pair[0].to() != pair[1].from() {
                return Err(ExecError::Config(format!(
                    "execution segment sequence has a gap between {} and {}",
                    pair[0], pair[1]
                )));
            }
        }
        if segments[segments.len() - 1].to() != Fraction::ONE {
            return Err(ExecError::Config(
                "execution segment sequence must end at 1".into(),
            ));
        }
        Ok(Self(segments))
    }

    /// Accepts the boundary list form, e.g. `"0,1/4,1/2,1"`.
    pub fn parse(s: &str) -> Result<Self, ExecError> {
        let points = s
            .split(',')
            .map(Fraction::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if points.len() < 2 {
            return Err(ExecError::Config(format!(
                "execution segment sequence {s:?} needs at least two boundaries"
            )));
        }
        let segments = points
            .windows(2)
            .map(|pair| ExecutionSegment::new(pair[0], pair[1]))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(segments)
    }

    /// The sequence an instance falls back to when only its own segment is
    /// known: the segment itself plus whatever surrounds it. Deterministic, so
    /// uncoordinated instances derive the same striping.
    pub fn enclosing(segment: &ExecutionSegment) -> Self {
        let mut segments = Vec::with_capacity(3);
        if segment.from() != Fraction::ZERO {
            segments.push(ExecutionSegment {
                from: Fraction::ZERO,
                to: segment.from(),
            });
        }
        segments.push(*segment);
        if segment.to() != Fraction::ONE {
            segments.push(ExecutionSegment {
                from: segment.to(),
                to: Fraction::ONE,
            });
        }
        Self(segments)
    }

    pub fn segments(&self) -> &[ExecutionSegment] {
        &self.0
    }

    fn position_of(&self, segment: &ExecutionSegment) -> Result<usize, ExecError> {
        self.0
            .iter()
            .position(|s| s == segment)
            .ok_or_else(|| {
                ExecError::Config(format!(
                    "segment {segment} is not part of the execution segment sequence"
                ))
            })
    }

    /// Least common denominator of all segment lengths, i.e. the stripe count
    /// of one striping cycle.
    fn lcd(&self) -> u64 {
        self.0
            .iter()
            .fold(1, |acc, s| lcm(acc, s.length().den()))
    }
}

/// An instance's segment, the full sequence, and the precomputed striping of
/// one cycle. This is everything an executor or ID allocator needs in order to
/// act only on the work this instance owns.
#[derive(Debug, Clone)]
pub struct ExecutionTuple {
    segment: ExecutionSegment,
    sequence: ExecutionSegmentSequence,
    /// Stripe positions this instance owns within one cycle, ascending.
    owned: Vec<u64>,
    /// Walk distances between consecutive owned stripes; the last entry wraps
    /// into the next cycle.
    offsets: Vec<u64>,
    lcd: u64,
}

impl ExecutionTuple {
    pub fn new(
        segment: ExecutionSegment,
        sequence: Option<ExecutionSegmentSequence>,
    ) -> Result<Self, ExecError> {
        let sequence =
            sequence.unwrap_or_else(|| ExecutionSegmentSequence::enclosing(&segment));
        let position = sequence.position_of(&segment)?;
        let lcd = sequence.lcd();

        // Quota of stripes per segment within one cycle of `lcd` stripes.
        let counts: Vec<u64> = sequence
            .segments()
            .iter()
            .map(|s| {
                let len = s.length();
                len.num() * (lcd / len.den())
            })
            .collect();

        // Deficit-greedy assignment: every stripe goes to the segment lagging
        // furthest behind its ideal share. Deterministic (ties break to the
        // earlier segment) and exact: each segment ends the cycle with
        // precisely its quota.
        let mut assigned = vec![0u64; counts.len()];
        let mut owned = Vec::with_capacity(counts[position] as usize);
        for stripe in 0..lcd {
            let mut best = 0usize;
            let mut best_deficit = i128::MIN;
            for (j, &count) in counts.iter().enumerate() {
                let deficit =
                    count as i128 * (stripe as i128 + 1) - lcd as i128 * assigned[j] as i128;
                if deficit > best_deficit {
                    best = j;
                    best_deficit = deficit;
                }
            }
            assigned[best] += 1;
            if best == position {
                owned.push(stripe);
            }
        }

        let mut offsets = Vec::with_capacity(owned.len());
        for pair in owned.windows(2) {
            offsets.push(pair[1] - pair[0]);
        }
        offsets.push(lcd - owned[owned.len() - 1] + owned[0]);

        Ok(Self {
            segment,
            sequence,
            owned,
            offsets,
            lcd,
        })
    }

    /// Tuple for an unsegmented run: the instance owns everything.
    pub fn full() -> Self {
        Self::new(ExecutionSegment::full(), None).expect("full segment is always valid")
    }

    pub fn segment(&self) -> &ExecutionSegment {
        &self.segment
    }

    pub fn sequence(&self) -> &ExecutionSegmentSequence {
        &self.sequence
    }

    /// How many of the first `n` global work units belong to this instance.
    pub fn scale(&self, n: u64) -> u64 {
        let cycles = n / self.lcd;
        let rem = n % self.lcd;
        let partial = self.owned.iter().filter(|&&p| p < rem).count() as u64;
        cycles * self.owned.len() as u64 + partial
    }

    pub fn segmented_index(&self) -> SegmentedIndex {
        SegmentedIndex {
            start: self.owned[0],
            lcd: self.lcd,
            offsets: self.offsets.clone(),
            scaled: 0,
            unscaled: 0,
        }
    }
}

/// Monotonic allocator of `(scaled, unscaled)` ID pairs: `scaled` is the dense
/// per-instance index, `unscaled` the sparse global one. Both start at 1.
/// Callers serialize access with their own mutex; `next` never blocks.
#[derive(Debug)]
pub struct SegmentedIndex {
    start: u64,
    lcd: u64,
    offsets: Vec<u64>,
    scaled: u64,
    unscaled: u64,
}

impl SegmentedIndex {
    pub fn next(&mut self) -> (u64, u64) {
        if self.scaled == 0 {
            self.unscaled += self.start + 1;
        } else {
            self.unscaled += self.offsets[(self.scaled as usize - 1) % self.offsets.len()];
        }
        self.scaled += 1;
        (self.scaled, self.unscaled)
    }

    pub fn lcd(&self) -> u64 {
        self.lcd
    }
}
