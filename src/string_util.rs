
/// contains ASCII to integer encoding
const STRING_TO_INT: [u8; 256] = build_stoi();

/// contains integer to ASCII encoding
const INT_TO_STRING: [u8; 5] = [
    b'A', b'C', b'G',
    b'T', b'N'
];

/// the number of real nucleotides, `N` is excluded
pub const NT_COUNT: usize = 4;

/// the integer code for an unknown base
pub const N_CODE: u8 = 4;

/// for complementing in the integer space; note that N goes to itself
pub const COMPLEMENT_INT: [u8; 5] = [3, 2, 1, 0, 4]; //ACGTN -> TGCAN

/// builds up the STRING_TO_INT const for us
const fn build_stoi() -> [u8; 256] {
    let mut ret: [u8; 256] = [N_CODE; 256];

    ret['A' as usize] = 0;
    ret['C' as usize] = 1;
    ret['G' as usize] = 2;
    ret['T' as usize] = 3;

    ret['a' as usize] = 0;
    ret['c' as usize] = 1;
    ret['g' as usize] = 2;
    ret['t' as usize] = 3;

    ret
}

/// Returns the integer code for a single ASCII nucleotide, anything unrecognized is `N`.
/// # Examples
/// ```rust
/// use migcall::string_util::char_to_base;
/// assert_eq!(char_to_base(b'G'), 2);
/// assert_eq!(char_to_base(b'x'), 4);
/// ```
#[inline]
pub fn char_to_base(c: u8) -> u8 {
    STRING_TO_INT[c as usize]
}

/// Returns the ASCII character for an integer nucleotide code.
/// # Examples
/// ```rust
/// use migcall::string_util::base_to_char;
/// assert_eq!(base_to_char(3), 'T');
/// ```
#[inline]
pub fn base_to_char(b: u8) -> char {
    INT_TO_STRING[std::cmp::min(b, N_CODE) as usize] as char
}

/// Helper function that reverse complements an integer vector
/// # Arguments
/// * `seq` - the sequence to reverse complement in integer format
/// # Examples
/// ```rust
/// use migcall::string_util::reverse_complement_i;
/// let seq: Vec<u8> = vec![0, 1, 2, 3, 4]; //"ACGTN"
/// let rev_comp = reverse_complement_i(&seq);
/// assert_eq!(rev_comp, vec![4, 0, 1, 2, 3]); //"NACGT"
/// ```
#[inline]
pub fn reverse_complement_i(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev() //reverse
        .map(|&c| COMPLEMENT_INT[c as usize]) //complement
        .collect::<Vec<u8>>() //collect and return
}

/// Helper function that converts a string to the corresponding Vec<u8> representation
/// # Arguments
/// * `seq` - the sequence to convert to integer
/// # Examples
/// ```rust
/// use migcall::string_util::convert_stoi;
/// let test = "ACGTN";
/// let converted = convert_stoi(&test);
/// assert_eq!(converted, vec![0, 1, 2, 3, 4]);
/// ```
#[inline]
pub fn convert_stoi(seq: &str) -> Vec<u8> {
    convert_btoi(seq.as_bytes())
}

/// Same as `convert_stoi`, but for raw ASCII bytes as they come out of a FASTX parser.
#[inline]
pub fn convert_btoi(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .map(|&c| STRING_TO_INT[c as usize])
        .collect::<Vec<u8>>()
}

/// Helper function that converts an integer array to its corresponding String representation
/// # Arguments
/// * `iseq` - the integer sequence to convert to String
/// # Examples
/// ```rust
/// use migcall::string_util::convert_itos;
/// let test: Vec<u8> = vec![0, 1, 2, 3, 4];
/// let converted = convert_itos(&test);
/// assert_eq!(&converted, "ACGTN");
/// ```
#[inline]
pub fn convert_itos(iseq: &[u8]) -> String {
    iseq.iter()
        .map(|&v| base_to_char(v))
        .collect::<String>()
}
