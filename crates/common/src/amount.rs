use num_bigint::{BigInt, BigUint, Sign};

/// Limb decomposition of a signed 128 bit value, most significant half
/// first. `hi` carries the sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct I128Parts {
	pub hi: i64,
	pub lo: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct U128Parts {
	pub hi: u64,
	pub lo: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct I256Parts {
	pub hi_hi: i64,
	pub hi_lo: u64,
	pub lo_hi: u64,
	pub lo_lo: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct U256Parts {
	pub hi_hi: u64,
	pub hi_lo: u64,
	pub lo_hi: u64,
	pub lo_lo: u64,
}

/// A large integer value as decoded from the ledger, preserving the
/// original limbs alongside canonical decimal rendering. Negative
/// 128/256 bit values are two's complement, recovered by subtracting
/// `2^128`/`2^256` from the unsigned interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "width", content = "limbs")]
pub enum Amount {
	I128(I128Parts),
	U128(U128Parts),
	I256(I256Parts),
	U256(U256Parts),
	/// Classic operation amounts are plain stroops
	I64(i64),
}

impl Amount {
	pub fn i128(hi: i64, lo: u64) -> Self {
		Amount::I128(I128Parts { hi, lo })
	}

	pub fn from_i128(value: i128) -> Self {
		Amount::I128(I128Parts { hi: (value >> 64) as i64, lo: value as u64 })
	}

	pub fn to_bigint(&self) -> BigInt {
		match self {
			Amount::I64(v) => BigInt::from(*v),
			Amount::I128(p) => {
				let unsigned = (BigUint::from(p.hi as u64) << 64) + BigUint::from(p.lo);
				signed_from_unsigned(unsigned, 128, p.hi < 0)
			},
			Amount::U128(p) => {
				BigInt::from_biguint(Sign::Plus, (BigUint::from(p.hi) << 64) + BigUint::from(p.lo))
			},
			Amount::I256(p) => {
				let unsigned = (BigUint::from(p.hi_hi as u64) << 192)
					+ (BigUint::from(p.hi_lo) << 128)
					+ (BigUint::from(p.lo_hi) << 64)
					+ BigUint::from(p.lo_lo);
				signed_from_unsigned(unsigned, 256, p.hi_hi < 0)
			},
			Amount::U256(p) => BigInt::from_biguint(
				Sign::Plus,
				(BigUint::from(p.hi_hi) << 192)
					+ (BigUint::from(p.hi_lo) << 128)
					+ (BigUint::from(p.lo_hi) << 64)
					+ BigUint::from(p.lo_lo),
			),
		}
	}

	/// Canonical base 10 rendering, leading `-` for negative values
	pub fn decimal(&self) -> String {
		self.to_bigint().to_string()
	}

	pub fn magnitude(&self) -> BigUint {
		self.to_bigint().magnitude().clone()
	}

	pub fn is_negative(&self) -> bool {
		self.to_bigint().sign() == Sign::Minus
	}
}

fn signed_from_unsigned(unsigned: BigUint, bits: u32, negative: bool) -> BigInt {
	if negative {
		BigInt::from_biguint(Sign::Plus, unsigned) - (BigInt::from(1) << bits)
	} else {
		BigInt::from_biguint(Sign::Plus, unsigned)
	}
}

impl std::fmt::Display for Amount {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.decimal())
	}
}
