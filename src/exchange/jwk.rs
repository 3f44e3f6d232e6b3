//! JSON Web Key conversions.
//!
//! Bridges between the DER-encoded `SubjectPublicKeyInfo` kept in
//! [`SigningKey::public_material`](super::keys::SigningKey) and the JWK
//! representation published at `/.well-known/jwks.json` (RFC 7517), and
//! between JWKs and verification keys for trusted issuers.
//!
//! Key ids are RFC 7638 thumbprints: `base64url(SHA-256(canonical JWK))`.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters,
    EllipticCurveKeyType, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse, RSAKeyParameters, RSAKeyType,
};
use sha2::{Digest, Sha256};
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

use super::keys::{KeyError, SigningAlgorithm};

/// A verification key resolved from a trusted JWK.
#[derive(Clone)]
pub struct TrustedKey {
    /// Algorithm the key is bound to. Tokens claiming another `alg` fail.
    pub algorithm: SigningAlgorithm,
    /// Key used by `jsonwebtoken` to check signatures.
    pub decoding: DecodingKey,
}

impl std::fmt::Debug for TrustedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustedKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Base64url public key components.
enum Components {
    Rsa { n: String, e: String },
    Ec { x: String, y: String },
}

/// Extract base64url JWK components from a DER `SubjectPublicKeyInfo`.
fn components(algorithm: SigningAlgorithm, spki_der: &[u8]) -> Result<Components, KeyError> {
    let (_, spki) = SubjectPublicKeyInfo::from_der(spki_der)
        .map_err(|e| KeyError::InvalidMaterial(format!("SPKI decode: {e}")))?;
    let parsed = spki
        .parsed()
        .map_err(|e| KeyError::InvalidMaterial(format!("public key decode: {e}")))?;

    match (algorithm, parsed) {
        (SigningAlgorithm::RS256, PublicKey::RSA(rsa)) => Ok(Components::Rsa {
            n: URL_SAFE_NO_PAD.encode(strip_leading_zeros(rsa.modulus)),
            e: URL_SAFE_NO_PAD.encode(strip_leading_zeros(rsa.exponent)),
        }),
        (SigningAlgorithm::ES256, PublicKey::EC(point)) => {
            // Uncompressed P-256 point: 0x04 || X (32 bytes) || Y (32 bytes)
            let data = point.data();
            if data.len() != 65 || data[0] != 0x04 {
                return Err(KeyError::InvalidMaterial(
                    "expected uncompressed P-256 point".to_string(),
                ));
            }
            Ok(Components::Ec {
                x: URL_SAFE_NO_PAD.encode(&data[1..33]),
                y: URL_SAFE_NO_PAD.encode(&data[33..65]),
            })
        }
        (alg, _) => Err(KeyError::InvalidMaterial(format!(
            "public key does not match algorithm {alg}"
        ))),
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// RFC 7638 JWK thumbprint of a public key.
///
/// Members are serialized in lexicographic order with no whitespace.
pub fn thumbprint(algorithm: SigningAlgorithm, spki_der: &[u8]) -> Result<String, KeyError> {
    let canonical = match components(algorithm, spki_der)? {
        Components::Rsa { n, e } => format!(r#"{{"e":"{e}","kty":"RSA","n":"{n}"}}"#),
        Components::Ec { x, y } => {
            format!(r#"{{"crv":"P-256","kty":"EC","x":"{x}","y":"{y}"}}"#)
        }
    };
    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
}

/// Build the public JWK for a signing key.
pub fn public_jwk(
    key_id: &str,
    algorithm: SigningAlgorithm,
    spki_der: &[u8],
) -> Result<Jwk, KeyError> {
    let common = CommonParameters {
        public_key_use: Some(PublicKeyUse::Signature),
        key_algorithm: Some(match algorithm {
            SigningAlgorithm::RS256 => KeyAlgorithm::RS256,
            SigningAlgorithm::ES256 => KeyAlgorithm::ES256,
        }),
        key_id: Some(key_id.to_string()),
        ..Default::default()
    };

    let algorithm = match components(algorithm, spki_der)? {
        Components::Rsa { n, e } => AlgorithmParameters::RSA(RSAKeyParameters {
            key_type: RSAKeyType::RSA,
            n,
            e,
        }),
        Components::Ec { x, y } => AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
            key_type: EllipticCurveKeyType::EC,
            curve: EllipticCurve::P256,
            x,
            y,
        }),
    };

    Ok(Jwk { common, algorithm })
}

/// Convert a JWK into a verification key.
///
/// Returns `None` for key types outside the supported set (symmetric keys,
/// OKP, curves other than P-256) and for keys marked `use: enc`.
pub fn trusted_key(jwk: &Jwk) -> Option<TrustedKey> {
    if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
        return None;
    }

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => {
            if !matches!(jwk.common.key_algorithm, None | Some(KeyAlgorithm::RS256)) {
                return None;
            }
            DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
                .ok()
                .map(|decoding| TrustedKey {
                    algorithm: SigningAlgorithm::RS256,
                    decoding,
                })
        }
        AlgorithmParameters::EllipticCurve(ec) => {
            if ec.curve != EllipticCurve::P256
                || !matches!(jwk.common.key_algorithm, None | Some(KeyAlgorithm::ES256))
            {
                return None;
            }
            DecodingKey::from_ec_components(&ec.x, &ec.y)
                .ok()
                .map(|decoding| TrustedKey {
                    algorithm: SigningAlgorithm::ES256,
                    decoding,
                })
        }
        _ => None,
    }
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a [`TrustedKey`].
pub fn find_trusted_key(jwks: &JwkSet, kid: &str) -> Option<TrustedKey> {
    jwks.keys
        .iter()
        .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))
        .and_then(trusted_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::PublicKeyData;

    fn spki(algorithm: SigningAlgorithm) -> Vec<u8> {
        let key_pair = rcgen::KeyPair::generate_for(algorithm.key_generation_algorithm()).unwrap();
        key_pair.subject_public_key_info()
    }

    #[test]
    fn es256_jwk_has_p256_coordinates() {
        // GIVEN: a fresh P-256 public key
        let der = spki(SigningAlgorithm::ES256);

        // WHEN: converted to a JWK
        let jwk = public_jwk("kid-1", SigningAlgorithm::ES256, &der).unwrap();

        // THEN: EC parameters with 32-byte coordinates (43 base64url chars)
        let AlgorithmParameters::EllipticCurve(ec) = &jwk.algorithm else {
            panic!("expected EC parameters");
        };
        assert_eq!(ec.curve, EllipticCurve::P256);
        assert_eq!(ec.x.len(), 43);
        assert_eq!(ec.y.len(), 43);
        assert_eq!(jwk.common.key_id.as_deref(), Some("kid-1"));
        assert_eq!(jwk.common.public_key_use, Some(PublicKeyUse::Signature));
    }

    #[test]
    fn rs256_jwk_has_standard_exponent() {
        // GIVEN: a fresh RSA public key
        let der = spki(SigningAlgorithm::RS256);

        // WHEN: converted to a JWK
        let jwk = public_jwk("kid-rsa", SigningAlgorithm::RS256, &der).unwrap();

        // THEN: e is 65537 (AQAB) and n carries no leading zero byte
        let AlgorithmParameters::RSA(rsa) = &jwk.algorithm else {
            panic!("expected RSA parameters");
        };
        assert_eq!(rsa.e, "AQAB");
        let n = URL_SAFE_NO_PAD.decode(&rsa.n).unwrap();
        assert_ne!(n[0], 0);
    }

    #[test]
    fn mismatched_algorithm_is_rejected() {
        let der = spki(SigningAlgorithm::ES256);
        assert!(public_jwk("kid", SigningAlgorithm::RS256, &der).is_err());
    }

    #[test]
    fn thumbprint_is_stable_and_distinct() {
        // GIVEN: two different keys
        let a = spki(SigningAlgorithm::ES256);
        let b = spki(SigningAlgorithm::ES256);

        // THEN: thumbprints are deterministic per key and differ across keys
        let ta = thumbprint(SigningAlgorithm::ES256, &a).unwrap();
        assert_eq!(ta, thumbprint(SigningAlgorithm::ES256, &a).unwrap());
        assert_ne!(ta, thumbprint(SigningAlgorithm::ES256, &b).unwrap());
        // SHA-256 digest = 43 base64url chars
        assert_eq!(ta.len(), 43);
    }

    #[test]
    fn published_jwk_converts_back_to_trusted_key() {
        // GIVEN: a published JWK set with one key
        let der = spki(SigningAlgorithm::ES256);
        let jwks = JwkSet {
            keys: vec![public_jwk("kid-1", SigningAlgorithm::ES256, &der).unwrap()],
        };

        // THEN: lookup by kid succeeds and binds ES256; unknown kid misses
        let key = find_trusted_key(&jwks, "kid-1").unwrap();
        assert_eq!(key.algorithm, SigningAlgorithm::ES256);
        assert!(find_trusted_key(&jwks, "other").is_none());
    }

    #[test]
    fn encryption_keys_are_not_trusted_for_signatures() {
        let der = spki(SigningAlgorithm::ES256);
        let mut jwk = public_jwk("kid-1", SigningAlgorithm::ES256, &der).unwrap();
        jwk.common.public_key_use = Some(PublicKeyUse::Encryption);
        assert!(trusted_key(&jwk).is_none());
    }
}
