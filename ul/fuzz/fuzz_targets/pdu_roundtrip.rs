#![no_main]
use std::error::Error;

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, &[u8])| {
    let (maxlen, data) = data;
    let _ = fuzz(maxlen, data);
});

fn fuzz(maxlen: u32, mut data: &[u8]) -> Result<(), Box<dyn Error>> {
    // decode random bytes
    let pdu = dicom_dul::pdu::read_pdu(&mut data, maxlen)?;

    // encode the PDU back to bytes,
    // which may fail for values that cannot be written back
    let bytes = dicom_dul::pdu::encode_pdu(&pdu)?;

    // whatever was encoded must decode to the same PDU
    let pdu2 = dicom_dul::pdu::read_pdu(&mut bytes.as_slice(), maxlen)
        .expect("encoded PDU should always decode");

    assert_eq!(pdu, pdu2, "PDU should be equal after encoding and decoding");

    Ok(())
}
