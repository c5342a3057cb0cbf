// Copyright 2024 Ulvetanna Inc.

//! Thin context over the BFV scheme.
//!
//! Everything the protocol needs from the lattice library goes through this
//! module: parameter construction, SIMD batching, encryption on the receiver,
//! relinearized ciphertext products on the sender, and byte-exact
//! (de)serialization at the wire boundary.

use std::sync::Arc;

use fhe::bfv::{
	BfvParameters, BfvParametersBuilder, Ciphertext, Encoding, Multiplicator, Plaintext,
	RelinearizationKey, SecretKey,
};
use fhe_traits::{
	DeserializeParametrized, FheDecoder, FheDecrypter, FheEncoder, FheEncrypter,
	Serialize as FheSerialize,
};
use rand::{CryptoRng, RngCore};

use crate::{error::Error, params::PsiParams};

/// Shared, immutable BFV context. Cheap to clone; both the sender database
/// and the query engine hold one.
#[derive(Clone)]
pub struct CryptoContext {
	params: Arc<BfvParameters>,
	degree: usize,
}

impl CryptoContext {
	pub fn new(psi: &PsiParams) -> Result<Self, Error> {
		let bfv = psi.bfv_params();
		let sizes: Vec<usize> = bfv.coeff_modulus_bits.iter().map(|&b| b as usize).collect();
		let params = BfvParametersBuilder::new()
			.set_degree(bfv.poly_modulus_degree as usize)
			.set_plaintext_modulus(bfv.plain_modulus)
			.set_moduli_sizes(&sizes)
			.build_arc()?;
		Ok(Self {
			params,
			degree: bfv.poly_modulus_degree as usize,
		})
	}

	pub fn bfv_params(&self) -> &Arc<BfvParameters> {
		&self.params
	}

	pub fn degree(&self) -> usize {
		self.degree
	}

	/// Batches one value per SIMD slot; shorter inputs are zero-padded.
	pub fn encode_simd(&self, values: &[u64]) -> Result<Plaintext, Error> {
		Ok(Plaintext::try_encode(values, Encoding::simd(), &self.params)?)
	}

	pub fn decode_simd(&self, plaintext: &Plaintext) -> Result<Vec<u64>, Error> {
		Ok(Vec::<u64>::try_decode(plaintext, Encoding::simd())?)
	}

	pub fn ciphertext_to_bytes(&self, ct: &Ciphertext) -> Vec<u8> {
		ct.to_bytes()
	}

	pub fn ciphertext_from_bytes(&self, bytes: &[u8]) -> Result<Ciphertext, Error> {
		Ciphertext::from_bytes(bytes, &self.params).map_err(|_| Error::InvalidCiphertext)
	}

	pub fn relin_key_from_bytes(&self, bytes: &[u8]) -> Result<RelinearizationKey, Error> {
		RelinearizationKey::from_bytes(bytes, &self.params)
			.map_err(|e| Error::Crypto(format!("relinearization keys are ill-formed: {e}")))
	}

	pub fn multiplicator(&self, relin_key: &RelinearizationKey) -> Result<Multiplicator, Error> {
		Ok(Multiplicator::default(relin_key)?)
	}
}

/// Receiver-side keys layered over the shared context.
pub struct ReceiverCrypto {
	context: CryptoContext,
	secret_key: SecretKey,
	relin_key_bytes: Vec<u8>,
}

impl ReceiverCrypto {
	pub fn new<R: RngCore + CryptoRng>(psi: &PsiParams, rng: &mut R) -> Result<Self, Error> {
		let context = CryptoContext::new(psi)?;
		let secret_key = SecretKey::random(context.bfv_params(), rng);
		let relin_key = RelinearizationKey::new(&secret_key, rng)?;
		Ok(Self {
			context,
			secret_key,
			relin_key_bytes: relin_key.to_bytes(),
		})
	}

	pub fn context(&self) -> &CryptoContext {
		&self.context
	}

	pub fn relin_key_bytes(&self) -> &[u8] {
		&self.relin_key_bytes
	}

	pub fn encrypt_simd<R: RngCore + CryptoRng>(
		&self,
		values: &[u64],
		rng: &mut R,
	) -> Result<Ciphertext, Error> {
		let plaintext = self.context.encode_simd(values)?;
		Ok(self.secret_key.try_encrypt(&plaintext, rng)?)
	}

	pub fn decrypt_simd(&self, ct: &Ciphertext) -> Result<Vec<u64>, Error> {
		let plaintext = self.secret_key.try_decrypt(ct)?;
		self.context.decode_simd(&plaintext)
	}
}
