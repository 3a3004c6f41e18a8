use sha2::{Digest, Sha256};
use tj_core::ClosedJaxpr;
use tj_runtime::marshal::value_to_bytes;

/// Structural identity of a closed program: its canonical fingerprint plus
/// the types and bytes of its bound constants. Hashed once per program
/// value; later calls reuse the stored digest.
#[must_use]
pub fn program_digest(program: &ClosedJaxpr) -> String {
    program.digest_with(hash_program).to_owned()
}

fn hash_program(program: &ClosedJaxpr) -> String {
    let mut hasher = Sha256::new();
    hasher.update(program.jaxpr.canonical_fingerprint().as_bytes());
    for value in &program.consts {
        hasher.update(b"|const:");
        hasher.update(value.aval().to_string().as_bytes());
        hasher.update(b"=");
        hasher.update(value_to_bytes(value));
    }
    bytes_to_hex(&hasher.finalize())
}

#[must_use]
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = std::fmt::Write::write_fmt(&mut out, format_args!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{bytes_to_hex, hash_program, program_digest};
    use tj_core::{Atom, ClosedJaxpr, Jaxpr, ProgramSpec, Value, VarId, build_program};

    fn const_program(value: Value) -> ClosedJaxpr {
        let jaxpr = Jaxpr::new(vec![], vec![VarId(1)], vec![Atom::Var(VarId(1))], vec![]);
        ClosedJaxpr::new(jaxpr, vec![value]).expect("closed")
    }

    #[test]
    fn digest_is_stable_for_equal_programs() {
        let a = ClosedJaxpr::open(build_program(ProgramSpec::Add2));
        let b = ClosedJaxpr::open(build_program(ProgramSpec::Add2));
        assert_eq!(program_digest(&a), program_digest(&b));
        assert_eq!(program_digest(&a).len(), 64);
    }

    #[test]
    fn digest_distinguishes_programs_and_constants() {
        let add = ClosedJaxpr::open(build_program(ProgramSpec::Add2));
        let sub = ClosedJaxpr::open(build_program(ProgramSpec::Sub2));
        assert_ne!(program_digest(&add), program_digest(&sub));
        assert_ne!(
            program_digest(&const_program(Value::scalar_f32(1.0))),
            program_digest(&const_program(Value::scalar_f32(2.0)))
        );
        // Same bytes, different type.
        assert_ne!(
            program_digest(&const_program(Value::scalar_i32(0))),
            program_digest(&const_program(Value::scalar_f32(0.0)))
        );
    }

    #[test]
    fn repeated_digests_reuse_the_first_hash() {
        let program = const_program(Value::scalar_f32(1.0));
        let first = program_digest(&program);
        assert_eq!(program_digest(&program), first);
        assert_eq!(hash_program(&program), first);
        // Digest taken from the stored slot, not rehashed.
        assert_eq!(program.digest_with(|_| String::new()), first);
    }

    #[test]
    fn hex_is_lowercase_and_padded() {
        assert_eq!(bytes_to_hex(&[0x0a, 0xff]), "0aff");
    }
}
